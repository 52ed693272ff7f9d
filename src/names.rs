//! Validation for the name grammars used on the wire.

/// Names (bus names, interfaces, members) are capped at 255 bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Checks the object path grammar: `/` or `/seg(/seg)*` with segments in
/// `[A-Za-z0-9_]`.
pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    path[1..]
        .split('/')
        .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'))
}

/// Interface names (and error names, which share the grammar): two or more
/// dot-separated elements, each starting with a non-digit.
pub fn is_valid_interface_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut elements = 0;
    for element in name.split('.') {
        if !is_valid_element(element, false) {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

/// Member names: a single element, no dots.
pub fn is_valid_member_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LEN && is_valid_element(name, false)
}

/// Unique connection names: `:` followed by two or more dot-separated
/// elements, which may start with a digit and may contain `-`.
pub fn is_valid_unique_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(':') else {
        return false;
    };
    if name.len() > MAX_NAME_LEN || rest.is_empty() {
        return false;
    }
    let mut elements = 0;
    for element in rest.split('.') {
        if element.is_empty()
            || !element
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

/// Well-known names: like interface names but elements may contain `-`.
pub fn is_valid_well_known_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.starts_with(':') {
        return false;
    }
    let mut elements = 0;
    for element in name.split('.') {
        if !is_valid_element(element, true) {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

pub fn is_valid_bus_name(name: &str) -> bool {
    is_valid_unique_name(name) || is_valid_well_known_name(name)
}

fn is_valid_element(element: &str, allow_hyphen: bool) -> bool {
    let mut bytes = element.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    let ok = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || (allow_hyphen && b == b'-');
    !first.is_ascii_digit() && ok(first) && bytes.all(ok)
}
