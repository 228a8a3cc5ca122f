// Naming helpers shared by the store: auto-incremented names and sequence children.

/// Child name of a sequence point: `000` for 1-D, `002_013` for 2-D, and so on.
pub fn sequence_child_name(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| format!("{:03}", i))
        .collect::<Vec<_>>()
        .join("_")
}

/// Splits `name.ext` into (`name`, `.ext`). Hidden-file style names keep their dot.
pub fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename, ""),
    }
}

/// `stem_NNN.ext` for auto-incremented names.
pub fn increment_name(filename: &str, n: usize) -> String {
    let (stem, ext) = split_extension(filename);
    format!("{}_{:03}{}", stem, n, ext)
}

/// Names starting with '.' are store-internal (sidecars, temporaries).
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sequence_names() {
        assert_eq!(sequence_child_name(&[0]), "000");
        assert_eq!(sequence_child_name(&[2, 13]), "002_013");
    }

    #[test]
    fn increments() {
        assert_eq!(increment_name("video.ma", 0), "video_000.ma");
        assert_eq!(increment_name("cell", 12), "cell_012");
        assert_eq!(split_extension(".log"), (".log", ""));
    }
}
