//! Naming convention linking a staged input to the converter's output.
//!
//! The external tool writes its result into the configured output directory
//! as `<stem of input file name>.pdf`. Cleanup relies on this: the
//! correlation key recorded at staging time is that same stem, so
//! `output_dir/<key>.pdf` is the file the tool produced for the request.

use std::path::{Path, PathBuf};

/// Extension of every artifact the converter produces.
pub const OUTPUT_EXTENSION: &str = "pdf";

/// Returns the stem of a file name: everything before the first `.`.
///
/// Directory components are ignored. A leading dot (hidden file) is not
/// treated as a separator, and a name with no usable stem is returned
/// unchanged.
pub fn stem(name: &str) -> &str {
    let base = base_name(name);
    match base.char_indices().find(|&(i, c)| c == '.' && i > 0) {
        Some((i, _)) => &base[..i],
        None => base,
    }
}

/// Final path component of `name`, accepting both separators.
pub fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Path where the tool is expected to leave the artifact for `correlation_key`.
pub fn expected_output(output_dir: &Path, correlation_key: &str) -> PathBuf {
    output_dir.join(format!("{}.{}", stem(correlation_key), OUTPUT_EXTENSION))
}

/// Filename suggested to the caller for downloading the converted artifact.
pub fn download_name(original_name: &str) -> String {
    format!("{}.{}", stem(original_name), OUTPUT_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem_strips_everything_after_first_dot() {
        assert_eq!(stem("report.docx"), "report");
        assert_eq!(stem("archive.tar.gz"), "archive");
        assert_eq!(stem("upload_a1B2c3.tmp-report.docx"), "upload_a1B2c3");
    }

    #[test]
    fn test_stem_without_extension() {
        assert_eq!(stem("README"), "README");
        assert_eq!(stem(".hidden"), ".hidden");
        assert_eq!(stem(".hidden.txt"), ".hidden");
    }

    #[test]
    fn test_stem_ignores_directories() {
        assert_eq!(stem("/data/in.v2/letter.odt"), "letter");
        assert_eq!(stem("C:\\docs\\memo.doc"), "memo");
    }

    #[test]
    fn test_download_name() {
        assert_eq!(download_name("My Thesis.final.docx"), "My Thesis.pdf");
        assert_eq!(download_name("scan"), "scan.pdf");
    }

    #[test]
    fn test_expected_output_matches_key_stem() {
        let dir = Path::new("/var/pdfa/out");
        let staged_name = "upload_Xy9.tmp-slides.pptx";
        let key = stem(staged_name);

        // The tool derives its output from the staged name; cleanup from the key.
        let from_tool = dir.join(format!("{}.pdf", stem(staged_name)));
        assert_eq!(expected_output(dir, key), from_tool);
        assert_eq!(expected_output(dir, key), PathBuf::from("/var/pdfa/out/upload_Xy9.pdf"));
    }
}
