//! Fragment fixups applied before dispatch

use regex::{Captures, Regex};
use std::sync::OnceLock;

static SHARP_NOTE: OnceLock<Regex> = OnceLock::new();
static ABSOLUTE_SAMPLE: OnceLock<Regex> = OnceLock::new();
static BACKSLASHES: OnceLock<Regex> = OnceLock::new();

/// Apply every fixup
pub fn normalize_fragment(code: &str) -> String {
    fix_sample_paths(&fix_sharp_notes(code))
}

/// `:C#4` is not a valid Ruby symbol; Sonic Pi spells it `:cs4`
pub fn fix_sharp_notes(code: &str) -> String {
    let pattern = SHARP_NOTE
        .get_or_init(|| Regex::new(r":([A-G])#(\d)").expect("sharp note pattern is valid"));

    pattern
        .replace_all(code, |caps: &Captures| {
            format!(":{}s{}", caps[1].to_ascii_lowercase(), &caps[2])
        })
        .into_owned()
}

/// Rewrite absolute `...Samples\\dir\\file.wav` sample paths to `dir/file.wav`
pub fn fix_sample_paths(code: &str) -> String {
    let pattern = ABSOLUTE_SAMPLE.get_or_init(|| {
        Regex::new(r#"sample\s+"(?:[^"]*Samples\\\\)([^"]+)""#)
            .expect("sample path pattern is valid")
    });
    let separators =
        BACKSLASHES.get_or_init(|| Regex::new(r"\\+").expect("separator pattern is valid"));

    pattern
        .replace_all(code, |caps: &Captures| {
            format!("sample \"{}\"", separators.replace_all(&caps[1], "/"))
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharp_notes() {
        assert_eq!(fix_sharp_notes("play :C#4"), "play :cs4");
        assert_eq!(
            fix_sharp_notes("play_chord [:F#3, :A3, :c#5]"),
            "play_chord [:fs3, :A3, :c#5]"
        );
        assert_eq!(fix_sharp_notes("play :e2"), "play :e2");
    }

    #[test]
    fn test_sample_paths() {
        let code = r#"sample "C:\\Users\\me\\Samples\\drums\\kick.wav", amp: 2"#;
        assert_eq!(fix_sample_paths(code), r#"sample "drums/kick.wav", amp: 2"#);

        let untouched = r#"sample :bd_haus"#;
        assert_eq!(fix_sample_paths(untouched), untouched);

        let relative = r#"sample "loops/amen.wav""#;
        assert_eq!(fix_sample_paths(relative), relative);
    }

    #[test]
    fn test_normalize_applies_both() {
        let code = "play :G#2\nsample \"D:\\\\Samples\\\\bass\\\\sub.wav\"\n";
        assert_eq!(
            normalize_fragment(code),
            "play :gs2\nsample \"bass/sub.wav\"\n"
        );
    }
}
