//! SDP rewriting pipeline applied to the local description before it is
//! handed back to the browser: low-latency hints, public-IP substitution,
//! and LAN-prioritized candidate ordering.

use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    MissingVersionLine,
    NoMediaSections,
}

impl std::fmt::Display for SdpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpError::MissingVersionLine => write!(f, "rewritten SDP is missing the v=0 line"),
            SdpError::NoMediaSections => write!(f, "rewritten SDP has no m= sections"),
        }
    }
}

impl std::error::Error for SdpError {}

struct MediaSection {
    header: String,
    lines: Vec<String>,
}

fn split_sections(sdp: &str) -> (Vec<String>, Vec<MediaSection>) {
    let mut session_lines = Vec::new();
    let mut sections: Vec<MediaSection> = Vec::new();

    for line in sdp.lines() {
        if line.starts_with("m=") {
            sections.push(MediaSection { header: line.to_string(), lines: Vec::new() });
        } else if let Some(section) = sections.last_mut() {
            section.lines.push(line.to_string());
        } else {
            session_lines.push(line.to_string());
        }
    }
    (session_lines, sections)
}

fn join_sections(session_lines: &[String], sections: &[MediaSection]) -> String {
    let mut out = session_lines.join("\r\n");
    for section in sections {
        out.push_str("\r\n");
        out.push_str(&section.header);
        for line in &section.lines {
            out.push_str("\r\n");
            out.push_str(line);
        }
    }
    out.push_str("\r\n");
    out
}

fn payload_type(header: &str) -> Option<&str> {
    header.split_whitespace().nth(3)
}

/// Append low-latency hints to each media section when not already present.
fn apply_low_latency_hints(sections: &mut [MediaSection]) {
    for section in sections.iter_mut() {
        let is_video = section.header.starts_with("m=video");
        let is_audio = section.header.starts_with("m=audio");
        if !is_video && !is_audio {
            continue;
        }
        let pt = payload_type(&section.header).unwrap_or("96").to_string();

        let mut additions = Vec::new();
        if is_video {
            if !section.lines.iter().any(|l| l.contains("x-google-flag:low-latency")) {
                additions.push("a=x-google-flag:low-latency".to_string());
            }
            if !section.lines.iter().any(|l| l.contains("minBufferedPlaybackTime")) {
                additions.push("a=minBufferedPlaybackTime:0".to_string());
            }
            if !section.lines.iter().any(|l| l.contains("extmap-allow-mixed")) {
                additions.push("a=extmap-allow-mixed".to_string());
            }
            if !section.lines.iter().any(|l| l.contains(&format!("fmtp:{}", pt))) {
                additions.push(format!("a=fmtp:{} packetization-mode=1;max-latency=0;profile-level-id=42001f", pt));
            }
        }
        for fb in ["nack pli", "goog-remb", "transport-cc"] {
            let marker = format!("rtcp-fb:{} {}", pt, fb);
            if !section.lines.iter().any(|l| l.contains(&marker)) {
                additions.push(format!("a=rtcp-fb:{} {}", pt, fb));
            }
        }
        section.lines.extend(additions);
    }
}

fn apply_public_ip(sections: &mut [MediaSection], session_lines: &mut [String], public_ip: &str) {
    for line in session_lines.iter_mut() {
        if line.starts_with("c=IN IP4") {
            *line = format!("c=IN IP4 {}", public_ip);
        }
    }
    for section in sections.iter_mut() {
        for line in section.lines.iter_mut() {
            if line.starts_with("c=IN IP4") {
                *line = format!("c=IN IP4 {}", public_ip);
            } else if line.starts_with("a=candidate") && line.contains("typ host") {
                *line = rewrite_candidate_address(line, public_ip);
            }
        }
    }
}

fn rewrite_candidate_address(line: &str, public_ip: &str) -> String {
    let mut fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() > 4 {
        let owned = public_ip.to_string();
        fields[4] = &owned;
        return fields.join(" ");
    }
    line.to_string()
}

fn is_private_address(addr: &str) -> bool {
    if let Ok(ip) = addr.parse::<IpAddr>() {
        match ip {
            IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
            IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80,
        }
    } else {
        false
    }
}

fn candidate_score(line: &str) -> i32 {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let protocol = fields.get(2).map(|s| s.to_ascii_lowercase()).unwrap_or_default();
    let address = fields.get(4).copied().unwrap_or_default();
    let component = fields.get(1).copied().unwrap_or_default();
    let typ = fields
        .iter()
        .position(|&f| f == "typ")
        .and_then(|i| fields.get(i + 1))
        .copied()
        .unwrap_or_default();

    let mut score = match typ {
        "host" if is_private_address(address) => 400,
        "host" => 320,
        "srflx" => 200,
        "prflx" => 150,
        "relay" => 50,
        _ => 0,
    };
    if protocol == "udp" {
        score += 40;
    }
    if component == "1" {
        score += 10;
    }
    score
}

fn reorder_candidates_for_lan(sections: &mut [MediaSection]) {
    for section in sections.iter_mut() {
        let mut candidate_indices: Vec<usize> = section
            .lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.starts_with("a=candidate"))
            .map(|(i, _)| i)
            .collect();
        if candidate_indices.len() < 2 {
            continue;
        }
        candidate_indices.sort_by_key(|&i| std::cmp::Reverse(candidate_score(&section.lines[i])));

        let mut reordered: Vec<String> = candidate_indices.iter().map(|&i| section.lines[i].clone()).collect();
        let mut out = Vec::with_capacity(section.lines.len());
        let mut cand_iter = reordered.drain(..);
        let mut is_candidate_slot = section.lines.iter().map(|l| l.starts_with("a=candidate"));
        for (line, is_cand) in section.lines.iter().zip(&mut is_candidate_slot) {
            if is_cand {
                out.push(cand_iter.next().unwrap());
            } else {
                out.push(line.clone());
            }
        }
        section.lines = out;
    }
}

pub struct RewriteOptions<'a> {
    pub public_ip: Option<&'a str>,
    pub prefer_lan_candidates: bool,
}

/// Apply the low-latency/public-IP/LAN-ordering pipeline, in that order.
pub fn rewrite_local_description(sdp: &str, opts: &RewriteOptions) -> Result<String, SdpError> {
    let (mut session_lines, mut sections) = split_sections(sdp);

    apply_low_latency_hints(&mut sections);
    if let Some(ip) = opts.public_ip {
        apply_public_ip(&mut sections, &mut session_lines, ip);
    }
    if opts.prefer_lan_candidates {
        reorder_candidates_for_lan(&mut sections);
    }

    let rewritten = join_sections(&session_lines, &sections);
    if !rewritten.contains("v=0") {
        return Err(SdpError::MissingVersionLine);
    }
    if sections.is_empty() {
        return Err(SdpError::NoMediaSections);
    }
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sdp_with_candidates() -> String {
        "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\nc=IN IP4 0.0.0.0\r\n\
a=candidate:1 1 udp 2122260223 203.0.113.5 55000 typ relay\r\n\
a=candidate:2 1 udp 2122260223 192.168.1.2 55001 typ host\r\n"
            .to_string()
    }

    #[test]
    fn adds_low_latency_hints_once() {
        let sdp = sample_sdp_with_candidates();
        let out = rewrite_local_description(&sdp, &RewriteOptions { public_ip: None, prefer_lan_candidates: false }).unwrap();
        assert!(out.contains("x-google-flag:low-latency"));
        assert_eq!(out.matches("x-google-flag:low-latency").count(), 1);
    }

    #[test]
    fn lan_candidate_sorts_first_when_preferred() {
        let sdp = sample_sdp_with_candidates();
        let out = rewrite_local_description(&sdp, &RewriteOptions { public_ip: None, prefer_lan_candidates: true }).unwrap();
        let first_candidate_line = out.lines().find(|l| l.starts_with("a=candidate")).unwrap();
        assert!(first_candidate_line.contains("192.168.1.2"));
    }

    #[test]
    fn public_ip_rewrites_host_candidate_address() {
        let sdp = sample_sdp_with_candidates();
        let out = rewrite_local_description(&sdp, &RewriteOptions { public_ip: Some("198.51.100.9"), prefer_lan_candidates: false }).unwrap();
        assert!(out.contains("c=IN IP4 198.51.100.9"));
    }

    #[test]
    fn rejects_sdp_with_no_media_sections() {
        let err = rewrite_local_description("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\n", &RewriteOptions { public_ip: None, prefer_lan_candidates: false });
        assert_eq!(err, Err(SdpError::NoMediaSections));
    }
}
