//! Deep-inspection host extractor (spec.md §4.A).
//!
//! Pure, allocation-free parsing of the first client->upstream payload,
//! recovering an HTTP `Host:` header or a TLS ClientHello SNI. Adapted
//! from `router-core/src/app/proxy.rs`'s `extract_http_host` /
//! `extract_sni_fast`, generalized behind a single `extract` entry point
//! and a result enum in place of the teacher's bare `Option<&str>`.

/// How a hostname was recovered from the first payload chunk, or that
/// none could be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMethod {
    HttpHost,
    TlsSni,
    None,
}

const HTTP_VERB_PREFIXES: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
];

/// Recover the real destination hostname from `buf`, the first chunk
/// read on the client->upstream direction. Bounded work, constant in the
/// size of the chunk (the HTTP scan caps at 1024 bytes; the TLS walk is
/// bounds-checked at every step and never panics on truncated input).
pub fn extract(buf: &[u8]) -> (Option<&str>, ExtractMethod) {
    if looks_like_http(buf) {
        if let Some(host) = extract_http_host(buf) {
            return (Some(strip_port(host)), ExtractMethod::HttpHost);
        }
        return (None, ExtractMethod::None);
    }
    if let Some(sni) = extract_sni(buf) {
        return (Some(sni), ExtractMethod::TlsSni);
    }
    (None, ExtractMethod::None)
}

fn looks_like_http(buf: &[u8]) -> bool {
    HTTP_VERB_PREFIXES
        .iter()
        .any(|verb| buf.starts_with(verb))
}

fn strip_port(host: &str) -> &str {
    // IPv6 literals are bracketed ("[::1]:443"); only strip a trailing
    // ":port" for the non-bracketed case.
    if host.starts_with('[') {
        return host;
    }
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

/// Scan the header block (ended by CRLFCRLF or end of buffer) for a
/// case-insensitive `Host:` line.
fn extract_http_host(buf: &[u8]) -> Option<&str> {
    let max_scan_len = std::cmp::min(buf.len(), 1024);
    let pattern = b"host:";

    if max_scan_len < pattern.len() {
        return None;
    }

    for i in 0..=max_scan_len - pattern.len() {
        if buf[i..i + pattern.len()].eq_ignore_ascii_case(pattern) {
            let start = i + pattern.len();
            let mut end = start;
            while end < max_scan_len && buf[end] != b'\r' && buf[end] != b'\n' {
                end += 1;
            }

            if end <= start {
                return None;
            }

            let value = &buf[start..end];
            let mut trim_start = 0;
            while trim_start < value.len() && (value[trim_start] == b' ' || value[trim_start] == b'\t')
            {
                trim_start += 1;
            }
            let mut trim_end = value.len();
            while trim_end > trim_start && (value[trim_end - 1] == b' ' || value[trim_end - 1] == b'\t')
            {
                trim_end -= 1;
            }

            if trim_end <= trim_start {
                return None;
            }
            return std::str::from_utf8(&value[trim_start..trim_end]).ok();
        }
    }

    None
}

/// Walk a TLS ClientHello's fixed fields then its extensions vector
/// looking for the `server_name` extension (type 0x0000). All length
/// reads are bounds-checked; any out-of-range read yields `None` rather
/// than panicking.
fn extract_sni(buf: &[u8]) -> Option<&str> {
    if buf.len() < 6 || buf[0] != 0x16 || buf[5] != 0x01 {
        return None;
    }

    let mut pos = 5usize; // record header
    pos = pos.checked_add(4)?; // handshake type (1) + length (3)
    if pos > buf.len() {
        return None;
    }
    pos = pos.checked_add(2)?; // client version
    if pos > buf.len() {
        return None;
    }
    pos = pos.checked_add(32)?; // client random
    if pos + 1 > buf.len() {
        return None;
    }

    let session_id_len = buf[pos] as usize;
    pos += 1;
    if pos + session_id_len > buf.len() {
        return None;
    }
    pos += session_id_len;

    if pos + 2 > buf.len() {
        return None;
    }
    let cipher_suites_len = ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize);
    pos += 2;
    if pos + cipher_suites_len > buf.len() {
        return None;
    }
    pos += cipher_suites_len;

    if pos + 1 > buf.len() {
        return None;
    }
    let compression_methods_len = buf[pos] as usize;
    pos += 1;
    if pos + compression_methods_len > buf.len() {
        return None;
    }
    pos += compression_methods_len;

    if pos + 2 > buf.len() {
        return None;
    }
    let extensions_len = ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize);
    pos += 2;
    if pos + extensions_len > buf.len() {
        return None;
    }

    let extensions_end = pos + extensions_len;
    while pos + 4 <= extensions_end {
        let ext_type = ((buf[pos] as u16) << 8) | (buf[pos + 1] as u16);
        let ext_len = ((buf[pos + 2] as usize) << 8) | (buf[pos + 3] as usize);
        pos += 4;

        if pos + ext_len > extensions_end {
            break;
        }

        if ext_type == 0x0000 {
            if ext_len < 2 {
                break;
            }
            let sni_list_len = ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize);
            let list_pos = pos + 2;
            if list_pos + sni_list_len <= extensions_end && sni_list_len >= 3 {
                if buf[list_pos] == 0 {
                    let name_pos = list_pos + 1;
                    if name_pos + 2 > extensions_end {
                        break;
                    }
                    let hostname_len = ((buf[name_pos] as usize) << 8) | (buf[name_pos + 1] as usize);
                    let hostname_start = name_pos + 2;
                    if hostname_start + hostname_len <= extensions_end {
                        return std::str::from_utf8(&buf[hostname_start..hostname_start + hostname_len]).ok();
                    }
                }
            }
            break;
        }

        pos += ext_len;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_http_host_case_insensitive_with_port_stripped() {
        let req = b"GET / HTTP/1.1\r\nHOST: example.com:8080\r\nUser-Agent: x\r\n\r\n";
        let (host, method) = extract(req);
        assert_eq!(host, Some("example.com"));
        assert_eq!(method, ExtractMethod::HttpHost);
    }

    #[test]
    fn extracts_tls_sni() {
        let hello = build_client_hello_with_sni("banned.test");
        let (host, method) = extract(&hello);
        assert_eq!(host, Some("banned.test"));
        assert_eq!(method, ExtractMethod::TlsSni);
    }

    #[test]
    fn truncated_buffer_never_panics_and_yields_none() {
        for len in 0..6 {
            let buf = vec![0x16u8; len];
            let (host, method) = extract(&buf);
            assert_eq!(host, None);
            assert_eq!(method, ExtractMethod::None);
        }
    }

    #[test]
    fn non_http_non_tls_yields_none() {
        let (host, method) = extract(b"\x00\x01\x02\x03garbage");
        assert_eq!(host, None);
        assert_eq!(method, ExtractMethod::None);
    }

    #[test]
    fn idempotent_on_same_buffer() {
        let hello = build_client_hello_with_sni("idempotent.example");
        let first = extract(&hello);
        let second = extract(&hello);
        assert_eq!(first, second);
    }

    /// Build a minimal well-formed ClientHello carrying a single SNI
    /// extension, for test purposes only.
    fn build_client_hello_with_sni(name: &str) -> Vec<u8> {
        let mut hello = Vec::new();
        // server_name extension body: list length(2) + name type(1) + name len(2) + name
        let mut ext_body = Vec::new();
        let name_bytes = name.as_bytes();
        let entry_len = 1 + 2 + name_bytes.len();
        ext_body.extend_from_slice(&(entry_len as u16).to_be_bytes());
        ext_body.push(0); // host_name type
        ext_body.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
        ext_body.extend_from_slice(name_bytes);

        let mut extension = Vec::new();
        extension.extend_from_slice(&0x0000u16.to_be_bytes()); // server_name type
        extension.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
        extension.extend_from_slice(&ext_body);

        let mut handshake_body = Vec::new();
        handshake_body.extend_from_slice(&[0x03, 0x03]); // client version
        handshake_body.extend_from_slice(&[0u8; 32]); // random
        handshake_body.push(0); // session id len
        handshake_body.extend_from_slice(&[0x00, 0x02]); // cipher suites len
        handshake_body.extend_from_slice(&[0x00, 0x00]); // one cipher suite
        handshake_body.push(1); // compression methods len
        handshake_body.push(0); // null compression
        handshake_body.extend_from_slice(&(extension.len() as u16).to_be_bytes()); // extensions len
        handshake_body.extend_from_slice(&extension);

        let handshake_len = 4 + handshake_body.len(); // type(1) + length(3) + body
        hello.push(0x16); // handshake record
        hello.extend_from_slice(&[0x03, 0x03]); // record version
        hello.extend_from_slice(&(handshake_len as u16).to_be_bytes()); // record length
        hello.push(0x01); // ClientHello
        let body_len = handshake_body.len() as u32;
        hello.extend_from_slice(&body_len.to_be_bytes()[1..]); // 3-byte length
        hello.extend_from_slice(&handshake_body);

        hello
    }
}
