use std::cmp::Ordering;

/// Version strings translate into a score that indicates how new the build
/// is:
///
/// `a.b.c+` -> `a*1000 + b*100 + c*10 + 1*[+]`
///
/// i.e. `0.6.1+` = 6 * 100 + 1 * 10 + 1 = 611. Components parse their
/// leading decimal digits and anything else scores 0; components beyond the
/// third are ignored. This scoring is deliberately coarse and is relied on
/// by fallback decisions downstream, so it must not be tightened.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    decompose_version(a).cmp(&decompose_version(b))
}

pub fn is_valid_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.is_empty() {
        return false;
    }
    for (index, raw) in parts.iter().enumerate() {
        let mut part = *raw;
        if index == parts.len() - 1 {
            if let Some(stripped) = part.strip_suffix('+') {
                part = stripped;
            }
        }
        if leading_digits(part).is_empty() {
            return false;
        }
    }
    true
}

fn decompose_version(version: &str) -> i64 {
    let mut result = 0;
    let mut version = version;
    if let Some(stripped) = version.strip_suffix('+') {
        version = stripped;
        result += 1;
    }

    let mut parts = version.split('.');
    result += component_value(parts.next()) * 1000;
    result += component_value(parts.next()) * 100;
    result += component_value(parts.next()) * 10;
    result
}

fn component_value(part: Option<&str>) -> i64 {
    let Some(part) = part else {
        return 0;
    };
    leading_digits(part).parse().unwrap_or(0)
}

fn leading_digits(part: &str) -> &str {
    let end = part
        .as_bytes()
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(part.len());
    &part[..end]
}
