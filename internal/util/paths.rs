/// Normalizes a client-supplied folder path: trims surrounding slashes,
/// converts backslashes, collapses `//` runs. Rejects any `..` segment.
pub fn normalize_custom_path(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    let mut path = trimmed
        .trim_matches(|ch| ch == '/' || ch == '\\')
        .replace('\\', "/");
    while path.contains("//") {
        path = path.replace("//", "/");
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err("path cannot contain '..'".into());
    }
    Ok(path)
}

/// Extension of a file name including the leading dot, `.bin` when absent.
pub fn file_extension(file_name: &str) -> String {
    let base = file_name.rsplit('/').next().unwrap_or(file_name);
    match base.rfind('.') {
        Some(idx) if idx > 0 && idx < base.len() - 1 => base[idx..].to_string(),
        _ => ".bin".to_string(),
    }
}

/// Zero-padded chunk key under a session prefix so lexicographic order
/// equals numeric order.
pub fn chunk_key(temp_prefix: &str, index: i32) -> String {
    format!("{temp_prefix}chunk_{index:05}.part")
}

pub fn composed_key(temp_prefix: &str, ext: &str) -> String {
    format!("{temp_prefix}composed{ext}")
}

pub fn hashed_object_name(file_hash: &str, ext: &str) -> String {
    format!("{file_hash}{ext}")
}

pub fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::{
        chunk_key, composed_key, file_extension, format_bytes, hashed_object_name,
        normalize_custom_path,
    };

    #[test]
    fn normalize_custom_path_handles_clean_input() {
        assert_eq!(normalize_custom_path("a/b/c").expect("ok"), "a/b/c");
        assert_eq!(normalize_custom_path("").expect("ok"), "");
        assert_eq!(normalize_custom_path("   ").expect("ok"), "");
    }

    #[test]
    fn normalize_custom_path_trims_and_collapses() {
        assert_eq!(normalize_custom_path("/a/b/").expect("ok"), "a/b");
        assert_eq!(normalize_custom_path("a///b").expect("ok"), "a/b");
        assert_eq!(normalize_custom_path("\\a\\b").expect("ok"), "a/b");
    }

    #[test]
    fn normalize_custom_path_rejects_parent_traversal() {
        assert!(normalize_custom_path("../etc").is_err());
        assert!(normalize_custom_path("a/../b").is_err());
        assert!(normalize_custom_path("..").is_err());
    }

    #[test]
    fn file_extension_keeps_last_suffix() {
        assert_eq!(file_extension("movie.tar.gz"), ".gz");
        assert_eq!(file_extension("photo.JPG"), ".JPG");
    }

    #[test]
    fn file_extension_falls_back_to_bin() {
        assert_eq!(file_extension("README"), ".bin");
        assert_eq!(file_extension(".gitignore"), ".bin");
        assert_eq!(file_extension("archive."), ".bin");
    }

    #[test]
    fn chunk_keys_sort_lexicographically_in_numeric_order() {
        let mut keys: Vec<String> = [11, 2, 0, 10, 1]
            .iter()
            .map(|idx| chunk_key("pending/s1/", *idx))
            .collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "pending/s1/chunk_00000.part",
                "pending/s1/chunk_00001.part",
                "pending/s1/chunk_00002.part",
                "pending/s1/chunk_00010.part",
                "pending/s1/chunk_00011.part",
            ]
        );
    }

    #[test]
    fn derived_keys_compose_prefix_hash_and_extension() {
        assert_eq!(composed_key("pending/s1/", ".zip"), "pending/s1/composed.zip");
        assert_eq!(hashed_object_name("abc123", ".txt"), "abc123.txt");
    }

    #[test]
    fn format_bytes_picks_unit() {
        assert_eq!(format_bytes(12), "12 B");
        assert_eq!(format_bytes(52_428_800), "50.0 MiB");
    }
}
