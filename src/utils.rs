use sha2::{Digest, Sha224};

/// Hash password using SHA224
pub fn hash_password(password: &str) -> [u8; 28] {
    let mut hasher = Sha224::new();
    hasher.update(password.as_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 28];
    hash.copy_from_slice(&result);
    hash
}

/// Password as it appears on the wire: lowercase hex of its SHA224 digest
pub fn password_to_hex(password: &str) -> [u8; 56] {
    let hash = hash_password(password);
    let hex_string = hex::encode(hash);
    let mut hex_bytes: [u8; 56] = [0u8; 56];
    hex_bytes.copy_from_slice(hex_string.as_bytes());
    hex_bytes
}

/// Strip an optional `:port` from a Host header value, keeping IPv6 brackets
pub fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_password_produces_28_bytes() {
        let hash = hash_password("test_password");
        assert_eq!(hash.len(), 28);
    }

    #[test]
    fn test_hash_password_deterministic() {
        assert_eq!(hash_password("same_password"), hash_password("same_password"));
    }

    #[test]
    fn test_hash_password_different_inputs() {
        assert_ne!(hash_password("password1"), hash_password("password2"));
    }

    #[test]
    fn test_password_to_hex_valid_hex_chars() {
        let hex = password_to_hex("secret");
        assert!(hex
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b)));
    }

    #[test]
    fn test_password_to_hex_known_value() {
        // SHA224("") is a published test vector
        let hex = password_to_hex("");
        assert_eq!(
            std::str::from_utf8(&hex).unwrap(),
            "d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f"
        );
    }

    #[test]
    fn test_host_without_port() {
        assert_eq!(host_without_port("example.com"), "example.com");
        assert_eq!(host_without_port("example.com:8443"), "example.com");
        assert_eq!(host_without_port("[2001:db8::1]:443"), "[2001:db8::1]");
        assert_eq!(host_without_port("[2001:db8::1]"), "[2001:db8::1]");
        assert_eq!(host_without_port("2001:db8::1"), "2001:db8::1");
    }
}
