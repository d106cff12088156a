//! Per-container argument files.
//!
//! A container named `NAME` may have a file `NAME` in the layer storage,
//! split into `[pull]`, `[start]` and `[exec]` sections. Each line of a
//! section is one command-line argument for the matching subcommand; blank
//! lines and lines starting with `#` are ignored.

use std::path::Path;

use anyhow::Context;

/// Returns the arguments listed under `[section]` in `text`.
pub fn section_args(text: &str, section: &str) -> Vec<String> {
    let mut active = false;
    let mut args = Vec::new();
    for line in text.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(header) = section_header(line) {
            active = header == section;
        } else if active {
            args.push(line.to_string());
        }
    }
    args
}

fn section_header(line: &str) -> Option<&str> {
    let header = line.strip_prefix('[')?.strip_suffix(']')?;
    (!header.is_empty() && header.bytes().all(|b| b.is_ascii_lowercase())).then_some(header)
}

/// Loads the `[section]` arguments of container `name`. A container
/// without a file has none.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn load_section(layer_dir: &Path, name: &str, section: &str) -> anyhow::Result<Vec<String>> {
    let path = layer_dir.join(name);
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let args = section_args(&text, section);
            tracing::debug!(path = %path.display(), section, args = args.len(), "loaded container arguments");
            Ok(args)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "\
[pull]
--url=https://registry.example/v2/library/alpine/manifests/latest

[start]
# layers from the registry
--overlay=4abcf2066143
--env=PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin
/bin/sh

[exec]
--env=TERM=xterm
";

    #[test]
    fn picks_only_the_requested_section() {
        assert_eq!(
            section_args(FILE, "start"),
            vec![
                "--overlay=4abcf2066143",
                "--env=PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
                "/bin/sh",
            ]
        );
        assert_eq!(section_args(FILE, "exec"), vec!["--env=TERM=xterm"]);
    }

    #[test]
    fn missing_section_is_empty() {
        assert!(section_args(FILE, "stop").is_empty());
        assert!(section_args("", "start").is_empty());
    }

    #[test]
    fn bracketed_arguments_are_not_headers() {
        let args = section_args("[start]\n[x1]\necho\n", "start");
        assert_eq!(args, vec!["[x1]", "echo"]);
    }

    #[test]
    fn absent_file_yields_no_arguments() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_section(dir.path(), "web", "start").expect("load").is_empty());

        std::fs::write(dir.path().join("web"), FILE).expect("write");
        assert_eq!(load_section(dir.path(), "web", "exec").expect("load").len(), 1);
    }
}
