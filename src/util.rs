/*
 * Small shared helpers.
 */

use crate::config::NAME_LEN;

/// Fixed-capacity object name. Every kernel object carries one; it shows
/// up in logs and in the assertion path.
pub type ObjName = heapless::String<NAME_LEN>;

/// Build an object name, truncating at a character boundary when the
/// input is longer than the stored capacity.
pub fn obj_name(s: &str) -> ObjName {
    let mut name = ObjName::new();
    for ch in s.chars() {
        if name.push(ch).is_err() {
            break;
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_names_truncate() {
        let n = obj_name("a-very-long-thread-name-indeed");
        assert_eq!(n.len(), NAME_LEN);
    }

    #[test]
    fn multibyte_names_truncate_cleanly() {
        let n = obj_name("ééééééééééééééééééé");
        assert!(n.len() <= NAME_LEN);
        assert!(n.as_str().chars().all(|c| c == 'é'));
    }
}
