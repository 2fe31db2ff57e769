//! Phone number helpers

/// Reduce a user supplied number to what the transport can dial.
///
/// Digits, `*` and `#` are kept, a `+` is replaced by the international
/// prefix and everything else (spaces, dashes, brackets) is dropped.
pub fn canonicalize_number(raw: &str, international_prefix: &str) -> String {
    let mut number = String::with_capacity(raw.len());

    for c in raw.chars() {
        match c {
            '0'..='9' | '*' | '#' => number.push(c),
            '+' => number.push_str(international_prefix),
            _ => {}
        }
    }

    number
}

/// Mask a number for log output.
///
/// The first two characters stay visible; numbers longer than four
/// characters also keep their last one.
pub fn scramble_number(number: &str) -> String {
    let chars: Vec<char> = number.chars().collect();
    let len = chars.len();

    if len <= 2 {
        return number.to_string();
    }

    let end = if len > 4 { len - 1 } else { len };

    chars
        .iter()
        .enumerate()
        .map(|(index, c)| if index >= 2 && index < end { 'X' } else { *c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_strips_formatting() {
        assert_eq!(canonicalize_number("(030) 123-456 7", "00"), "0301234567");
        assert_eq!(canonicalize_number("**610", "00"), "**610");
        assert_eq!(canonicalize_number("#96*5*", "00"), "#96*5*");
    }

    #[test]
    fn test_canonicalize_replaces_plus() {
        assert_eq!(canonicalize_number("+49 30 1234", "00"), "0049301234");
        assert_eq!(canonicalize_number("+1 555", "011"), "0111555");
    }

    #[test]
    fn test_scramble_number() {
        assert_eq!(scramble_number(""), "");
        assert_eq!(scramble_number("12"), "12");
        assert_eq!(scramble_number("1234"), "12XX");
        assert_eq!(scramble_number("0301234567"), "03XXXXXXX7");
    }
}
