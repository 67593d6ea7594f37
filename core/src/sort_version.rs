//! Sort keys for module versions.
//!
//! [`for_sorting`] maps a semantic version to a string whose byte-wise order
//! is semver precedence, so rows can be ordered by a plain string column.

// Separates prerelease identifiers; below every identifier character.
const ID_SEPARATOR: char = ',';
// Precedes a prerelease.
const PRERELEASE_MARK: char = '-';
// Terminates a release; above every other character used in keys.
const RELEASE_MARK: char = '~';
// Precedes an alphanumeric prerelease identifier; above every length prefix.
const ALNUM_MARK: char = '|';

/// Returns the sort key for `version`, or `version` itself when it is not of
/// the form `vMAJOR.MINOR.PATCH[-PRERELEASE][+BUILD]`.
pub fn for_sorting(version: &str) -> String {
    match parse(version) {
        Some(parts) => encode(&parts),
        None => version.to_string(),
    }
}

struct Parts<'a> {
    core: [&'a str; 3],
    prerelease: Option<Vec<&'a str>>,
}

fn parse(version: &str) -> Option<Parts<'_>> {
    let rest = version.strip_prefix('v')?;
    let rest = rest.split_once('+').map_or(rest, |(v, _build)| v);
    let (core, prerelease) = match rest.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (rest, None),
    };

    let mut numbers = core.split('.');
    let core = [numbers.next()?, numbers.next()?, numbers.next()?];
    if numbers.next().is_some() || !core.iter().all(|n| is_number(n)) {
        return None;
    }

    let prerelease = match prerelease {
        Some(pre) => {
            let ids: Vec<&str> = pre.split('.').collect();
            let valid = ids.iter().all(|id| {
                !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
            if !valid {
                return None;
            }
            Some(ids)
        }
        None => None,
    };

    Some(Parts { core, prerelease })
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

// Length-prefixed so that longer numbers sort after shorter ones.
fn push_number(out: &mut String, digits: &str) {
    let trimmed = digits.trim_start_matches('0');
    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };
    let len = trimmed.len().min(64) as u8;
    out.push(char::from(b'0' + len));
    out.push_str(trimmed);
}

fn encode(parts: &Parts<'_>) -> String {
    let mut out = String::new();
    for (i, number) in parts.core.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        push_number(&mut out, number);
    }

    match &parts.prerelease {
        None => out.push(RELEASE_MARK),
        Some(ids) => {
            out.push(PRERELEASE_MARK);
            for (i, id) in ids.iter().enumerate() {
                if i > 0 {
                    out.push(ID_SEPARATOR);
                }
                if is_number(id) {
                    push_number(&mut out, id);
                } else {
                    out.push(ALNUM_MARK);
                    out.push_str(id);
                }
            }
        }
    }
    out
}
