// ============================================
// naming.rs - Install name / title helpers
// ============================================

/// Characters that can't appear in a Windows file name. Commas are
/// stripped too since install names end up in msiexec command lines.
const INVALID_FILE_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', ','];

/// Remove characters that aren't allowed in a file name.
pub fn strip_invalid_file_name_chars(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control() && !INVALID_FILE_NAME_CHARS.contains(c))
        .collect()
}

/// Turn a raw install name into a usable path component:
/// invalid characters and spaces removed, underscore runs collapsed,
/// no leading/trailing underscores, no trailing dots.
pub fn sanitize_install_name(raw: &str) -> String {
    let stripped: String = strip_invalid_file_name_chars(raw)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let mut collapsed = String::with_capacity(stripped.len());
    for c in stripped.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }

    collapsed
        .trim_start_matches('_')
        .trim_end_matches(|c| c == '_' || c == '.')
        .to_string()
}

/// Collapse whitespace runs into single spaces and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `{Vendor }{Name} {Version}`; the vendor is left out when `include_vendor` is false.
pub fn build_install_title(vendor: Option<&str>, name: &str, version: Option<&str>, include_vendor: bool) -> String {
    let vendor = if include_vendor { vendor.unwrap_or_default() } else { "" };
    collapse_whitespace(&format!("{} {} {}", vendor, name, version.unwrap_or_default()))
}

/// `{Vendor_}{Name}_{Version}_{Arch}_{Lang}_{Revision}` before sanitizing.
pub fn build_install_name(vendor: Option<&str>, parts: &[Option<&str>], include_vendor: bool) -> String {
    let mut name = String::new();
    if include_vendor {
        if let Some(vendor) = vendor {
            name.push_str(vendor);
            name.push('_');
        }
    }
    let joined: Vec<&str> = parts.iter().map(|p| p.unwrap_or_default()).collect();
    name.push_str(&joined.join("_"));
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_clean(name: &str) -> bool {
        !name.is_empty()
            && !name.chars().any(|c| INVALID_FILE_NAME_CHARS.contains(&c) || c.is_whitespace() || c.is_control())
            && !name.starts_with('_')
            && !name.ends_with('_')
            && !name.contains("__")
    }

    #[test]
    fn test_sanitize_example() {
        let raw = build_install_name(
            Some("Contoso, Inc."),
            &[Some("Widget:Pro"), Some("1.0"), None, None, None],
            true,
        );
        let name = sanitize_install_name(&raw);
        assert_eq!(name, "ContosoInc._WidgetPro_1.0");
        assert!(is_clean(&name));
    }

    #[test]
    fn test_sanitize_many_combinations() {
        let vendors = [None, Some(""), Some("  _Acme_ "), Some("A<B>C"), Some("__")];
        let names = ["Widget", "My App", "x/y\\z", "_lead", "tail_", "a__b"];
        let versions = [None, Some("1.0"), Some(" 2 . 0 "), Some("?*")];
        let tails = [None, Some("x64"), Some("EN"), Some("01"), Some("|")];
        for vendor in vendors {
            for name in names {
                for version in versions {
                    for tail in tails {
                        let raw = build_install_name(vendor, &[Some(name), version, tail, tail, tail], true);
                        let clean = sanitize_install_name(&raw);
                        assert!(is_clean(&clean), "{:?} -> {:?}", raw, clean);
                    }
                }
            }
        }
    }

    #[test]
    fn test_sanitize_all_invalid_is_empty() {
        assert_eq!(sanitize_install_name(" _<>_ "), "");
    }

    #[test]
    fn test_install_title() {
        assert_eq!(
            build_install_title(Some("Contoso"), "Widget", Some("1.0"), true),
            "Contoso Widget 1.0"
        );
        assert_eq!(build_install_title(Some("Contoso"), "Widget", Some("1.0"), false), "Widget 1.0");
        assert_eq!(build_install_title(None, " Big   Widget ", None, true), "Big Widget");
    }

    #[test]
    fn test_strip_invalid_file_name_chars() {
        assert_eq!(strip_invalid_file_name_chars("a:b|c\u{1}.log"), "abc.log");
    }
}
