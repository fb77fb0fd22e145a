//! Formatting helpers for human-readable identifiers.

/// Build a full room alias, `#local:host`.
pub fn room_alias(local_part: &str, host: &str) -> String {
    format!("#{local_part}:{host}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_carry_sigil_and_host() {
        assert_eq!(room_alias("lobby", "chat.example.org"), "#lobby:chat.example.org");
        assert_eq!(room_alias("ops", "[::1]"), "#ops:[::1]");
    }
}
