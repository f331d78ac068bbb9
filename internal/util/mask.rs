/// Masks a credential for log output, keeping the first and last four
/// characters of long values.
pub fn mask_access_key(access_key: &str) -> String {
    if access_key.len() <= 8 {
        return "***********".to_string();
    }
    format!(
        "{}***********{}",
        &access_key[..4],
        &access_key[access_key.len() - 4..]
    )
}

#[cfg(test)]
mod tests {
    use super::mask_access_key;

    #[test]
    fn short_keys_are_fully_masked() {
        assert_eq!(mask_access_key("abc"), "***********");
        assert_eq!(mask_access_key("12345678"), "***********");
    }

    #[test]
    fn long_keys_keep_edges() {
        assert_eq!(mask_access_key("AKIA0123456789WXYZ"), "AKIA***********WXYZ");
    }
}
