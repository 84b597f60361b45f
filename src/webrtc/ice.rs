//! ICE candidate bookkeeping: TURN credential generation and the
//! ufrag-rewriting / deduplication pass applied to server-buffered
//! candidates before they're handed back to the browser.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::TurnServerConfig;

pub struct IceServerEntry {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Resolve configured TURN/STUN servers into a form ready for the peer
/// connection's ICE configuration, generating time-limited credentials for
/// any server configured with a shared secret (RFC 5766 §15).
pub fn resolve_ice_servers(turn_servers: &[TurnServerConfig], label: &str, ttl: Duration) -> Vec<IceServerEntry> {
    turn_servers
        .iter()
        .map(|server| {
            let (username, credential) = if let Some(secret) = &server.shared_secret {
                let expiry = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() + ttl.as_secs())
                    .unwrap_or(ttl.as_secs());
                let username = format!("{}:{}", expiry, label);
                let credential = hmac_sha1_base64(secret, &username);
                (Some(username), Some(credential))
            } else {
                (server.username.clone(), server.credential.clone())
            };
            IceServerEntry { urls: vec![server.url.clone()], username, credential }
        })
        .collect()
}

fn hmac_sha1_base64(secret: &str, message: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha1>::new_from_slice(&[]).unwrap());
    mac.update(message.as_bytes());
    let result = mac.finalize().into_bytes();
    base64::engine::general_purpose::STANDARD.encode(result)
}

/// A candidate's identity with the mutable negotiation tokens (`ufrag`,
/// `generation`, `network-cost`) stripped out, so two candidate lines that
/// only differ in those tokens compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingCandidateKey {
    kind: String,
    protocol: String,
    address: String,
    port: String,
    component: String,
}

pub fn candidate_key(candidate: &str) -> PendingCandidateKey {
    let fields: Vec<&str> = candidate.trim_start_matches("candidate:").split_whitespace().collect();
    // foundation component protocol priority address port typ type ...
    let component = fields.get(1).unwrap_or(&"").to_string();
    let protocol = fields.get(2).map(|s| s.to_ascii_lowercase()).unwrap_or_default();
    let address = fields.get(4).unwrap_or(&"").to_string();
    let port = fields.get(5).unwrap_or(&"").to_string();
    let kind = fields
        .iter()
        .position(|&f| f == "typ")
        .and_then(|i| fields.get(i + 1))
        .map(|s| s.to_string())
        .unwrap_or_default();
    PendingCandidateKey { kind, protocol, address, port, component }
}

pub struct BufferedCandidate {
    pub text: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Guarantee the `candidate:` prefix, a `generation 0` token, and the
/// correct `ice-ufrag` (preferring the remote description's ufrag, since
/// this candidate is being handed to the browser that owns it).
pub fn ensure_ufrag(candidate: &str, correct_ufrag: &str) -> String {
    let mut text = if candidate.starts_with("candidate:") {
        candidate.to_string()
    } else {
        format!("candidate:{}", candidate)
    };

    if !text.contains("generation") {
        text.push_str(" generation 0");
    }

    if let Some(pos) = text.find("ufrag ") {
        let rest_start = pos + "ufrag ".len();
        let rest = &text[rest_start..];
        let existing: String = rest.split_whitespace().next().unwrap_or("").to_string();
        if existing != correct_ufrag {
            text = format!("{}ufrag {}{}", &text[..pos], correct_ufrag, &text[rest_start + existing.len()..]);
        }
    } else {
        text.push_str(" ufrag ");
        text.push_str(correct_ufrag);
    }
    text
}

/// Insert/replace a candidate in the buffered set, deduplicating by core
/// key: a newer candidate replaces an older one iff the newer has a ufrag
/// the older lacked, or the ufrags differ.
pub fn upsert_candidate(
    buffered: &mut Vec<(PendingCandidateKey, BufferedCandidate)>,
    candidate: BufferedCandidate,
) {
    let key = candidate_key(&candidate.text);
    if let Some(slot) = buffered.iter_mut().find(|(k, _)| *k == key) {
        let old_has_ufrag = slot.1.text.contains("ufrag ");
        let new_has_ufrag = candidate.text.contains("ufrag ");
        if (new_has_ufrag && !old_has_ufrag) || extract_ufrag(&slot.1.text) != extract_ufrag(&candidate.text) {
            slot.1 = candidate;
        }
    } else {
        buffered.push((key, candidate));
    }
}

fn extract_ufrag(candidate: &str) -> Option<String> {
    candidate
        .find("ufrag ")
        .map(|pos| candidate[pos + 6..].split_whitespace().next().unwrap_or("").to_string())
}

/// Filter the buffered set to the candidates whose ufrag matches the
/// current remote description, so the browser never receives a candidate
/// keyed to stale credentials.
pub fn retrieve_for_ufrag<'a>(
    buffered: &'a [(PendingCandidateKey, BufferedCandidate)],
    remote_ufrag: &str,
) -> Vec<&'a BufferedCandidate> {
    buffered
        .iter()
        .filter(|(_, c)| extract_ufrag(&c.text).as_deref() == Some(remote_ufrag))
        .map(|(_, c)| c)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_ufrag_rewrites_stale_value() {
        let candidate = "candidate:1 1 udp 2122260223 192.168.1.2 55000 typ host generation 0 ufrag XYZ1";
        let rewritten = ensure_ufrag(candidate, "ABCD");
        assert!(rewritten.contains("ufrag ABCD"));
        assert!(!rewritten.contains("XYZ1"));
    }

    #[test]
    fn ensure_ufrag_adds_missing_tokens() {
        let candidate = "1 1 udp 2122260223 192.168.1.2 55000 typ host";
        let rewritten = ensure_ufrag(candidate, "ABCD");
        assert!(rewritten.starts_with("candidate:"));
        assert!(rewritten.contains("generation 0"));
        assert!(rewritten.contains("ufrag ABCD"));
    }

    #[test]
    fn candidate_key_ignores_ufrag_and_generation() {
        let a = "candidate:1 1 udp 2122260223 192.168.1.2 55000 typ host generation 0 ufrag AAAA";
        let b = "candidate:2 1 udp 2122260223 192.168.1.2 55000 typ host generation 1 ufrag BBBB";
        assert_eq!(candidate_key(a), candidate_key(b));
    }

    #[test]
    fn upsert_replaces_when_ufrag_differs() {
        let mut buffered = Vec::new();
        upsert_candidate(&mut buffered, BufferedCandidate {
            text: "candidate:1 1 udp 100 192.168.1.2 55000 typ host ufrag AAAA".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        });
        upsert_candidate(&mut buffered, BufferedCandidate {
            text: "candidate:1 1 udp 100 192.168.1.2 55000 typ host ufrag BBBB".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        });
        assert_eq!(buffered.len(), 1);
        assert!(buffered[0].1.text.contains("BBBB"));
    }

    #[test]
    fn retrieval_filters_by_matching_ufrag() {
        let mut buffered = Vec::new();
        upsert_candidate(&mut buffered, BufferedCandidate {
            text: "candidate:1 1 udp 100 192.168.1.2 55000 typ host ufrag ABCD".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        });
        upsert_candidate(&mut buffered, BufferedCandidate {
            text: "candidate:2 1 udp 100 10.0.0.5 55001 typ host ufrag WXYZ".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        });
        let matched = retrieve_for_ufrag(&buffered, "ABCD");
        assert_eq!(matched.len(), 1);
    }
}
