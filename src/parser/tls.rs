//! Metadata-only TLS handshake parsing: record/handshake headers, version,
//! cipher suites, and (for ClientHello) the SNI extension. No decryption,
//! no application-data inspection.

use crate::witness::TlsHandshakeMeta;

const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO: u8 = 2;
const EXT_SERVER_NAME: u16 = 0;

pub enum TlsParseOutcome {
    ClientHello(TlsHandshakeMeta),
    ServerHello(TlsHandshakeMeta),
    NotTls,
    Incomplete,
}

pub fn try_parse_handshake(buf: &[u8]) -> TlsParseOutcome {
    if buf.len() < 5 {
        return TlsParseOutcome::Incomplete;
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE {
        return TlsParseOutcome::NotTls;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < 5 + record_len {
        return TlsParseOutcome::Incomplete;
    }
    let handshake = &buf[5..5 + record_len];
    if handshake.len() < 4 {
        return TlsParseOutcome::Incomplete;
    }
    let handshake_type = handshake[0];
    let body = &handshake[4..];

    match handshake_type {
        HANDSHAKE_CLIENT_HELLO => parse_client_hello(body)
            .map(TlsParseOutcome::ClientHello)
            .unwrap_or(TlsParseOutcome::NotTls),
        HANDSHAKE_SERVER_HELLO => parse_server_hello(body)
            .map(TlsParseOutcome::ServerHello)
            .unwrap_or(TlsParseOutcome::NotTls),
        _ => TlsParseOutcome::NotTls,
    }
}

fn parse_client_hello(body: &[u8]) -> Option<TlsHandshakeMeta> {
    let mut cursor = 0usize;
    let version = read_u16(body, &mut cursor)?;
    cursor += 32; // client random

    let session_id_len = *body.get(cursor)? as usize;
    cursor += 1 + session_id_len;

    let cipher_suites_len = read_u16(body, &mut cursor)? as usize;
    let mut cipher_suites = Vec::with_capacity(cipher_suites_len / 2);
    for chunk in body.get(cursor..cursor + cipher_suites_len)?.chunks_exact(2) {
        cipher_suites.push(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    cursor += cipher_suites_len;

    let compression_len = *body.get(cursor)? as usize;
    cursor += 1 + compression_len;

    let sni = if cursor < body.len() {
        let extensions_len = read_u16(body, &mut cursor)? as usize;
        let extensions = body.get(cursor..cursor + extensions_len)?;
        find_sni(extensions)
    } else {
        None
    };

    Some(TlsHandshakeMeta {
        sni,
        version: version_string(version),
        cipher_suites,
    })
}

fn parse_server_hello(body: &[u8]) -> Option<TlsHandshakeMeta> {
    let mut cursor = 0usize;
    let version = read_u16(body, &mut cursor)?;
    cursor += 32;
    let session_id_len = *body.get(cursor)? as usize;
    cursor += 1 + session_id_len;
    let cipher_suite = read_u16(body, &mut cursor)?;

    Some(TlsHandshakeMeta {
        sni: None,
        version: version_string(version),
        cipher_suites: vec![cipher_suite],
    })
}

fn find_sni(extensions: &[u8]) -> Option<String> {
    let mut cursor = 0usize;
    while cursor + 4 <= extensions.len() {
        let ext_type = u16::from_be_bytes([extensions[cursor], extensions[cursor + 1]]);
        let ext_len = u16::from_be_bytes([extensions[cursor + 2], extensions[cursor + 3]]) as usize;
        cursor += 4;
        let ext_data = extensions.get(cursor..cursor + ext_len)?;
        if ext_type == EXT_SERVER_NAME && ext_data.len() > 2 {
            let list_len = u16::from_be_bytes([ext_data[0], ext_data[1]]) as usize;
            let list = ext_data.get(2..2 + list_len)?;
            if list.len() > 3 && list[0] == 0 {
                let name_len = u16::from_be_bytes([list[1], list[2]]) as usize;
                let name = list.get(3..3 + name_len)?;
                return Some(String::from_utf8_lossy(name).into_owned());
            }
        }
        cursor += ext_len;
    }
    None
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Option<u16> {
    let value = u16::from_be_bytes([*buf.get(*cursor)?, *buf.get(*cursor + 1)?]);
    *cursor += 2;
    Some(value)
}

fn version_string(raw: u16) -> String {
    match raw {
        0x0301 => "TLS 1.0".into(),
        0x0302 => "TLS 1.1".into(),
        0x0303 => "TLS 1.2 (or 1.3 hello)".into(),
        other => format!("0x{:04x}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_handshake_content_type() {
        let buf = [23u8, 3, 3, 0, 1, 0];
        assert!(matches!(try_parse_handshake(&buf), TlsParseOutcome::NotTls));
    }

    #[test]
    fn incomplete_record_waits_for_more_bytes() {
        let buf = [22u8, 3, 3, 0, 10];
        assert!(matches!(
            try_parse_handshake(&buf),
            TlsParseOutcome::Incomplete
        ));
    }
}
