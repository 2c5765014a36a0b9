//! Named string properties with `{name}` interpolation.
//!
//! The property bag is rebuilt from live configuration each time a step
//! runs, so templated arguments always see current values.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A flat name-to-string mapping used for templated interpolation.
#[derive(Debug, Default)]
pub struct PropertyBag {
    map: BTreeMap<String, String>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.map.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Result<&str> {
        self.map
            .get(name)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::UnknownProperty(name.to_string()))
    }

    /// Property names in sorted order, for `--print` without a format.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(|s| s.as_str())
    }

    /// Replace each `{name}` token with the value of `name`. `{{` and `}}`
    /// are literal braces. Substitution is a single pass: values containing
    /// `{other}` are not expanded again.
    pub fn expand(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    if chars.peek() == Some(&'{') {
                        chars.next();
                        out.push('{');
                        continue;
                    }
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => {
                                return Err(Error::Config(format!(
                                    "unterminated '{{' in {:?}",
                                    template
                                )))
                            }
                        }
                    }
                    out.push_str(self.get(&name)?);
                }
                '}' => {
                    if chars.peek() == Some(&'}') {
                        chars.next();
                    }
                    out.push('}');
                }
                c => out.push(c),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag() -> PropertyBag {
        let mut bag = PropertyBag::new();
        bag.set("user", "alice");
        bag.set("jailhome", "/var/jails/alice/home");
        bag
    }

    #[test]
    fn test_expand() {
        let bag = bag();
        assert_eq!(
            bag.expand("{jailhome}/etc for {user}").unwrap(),
            "/var/jails/alice/home/etc for alice"
        );
        assert_eq!(bag.expand("no tokens").unwrap(), "no tokens");
    }

    #[test]
    fn test_unknown_name_fails() {
        let err = bag().expand("{nope}").unwrap_err();
        assert!(err.to_string().contains("'nope'"));
    }

    #[test]
    fn test_literal_braces() {
        let bag = bag();
        assert_eq!(bag.expand("{{user}}").unwrap(), "{user}");
        assert_eq!(bag.expand("a}}b").unwrap(), "a}b");
    }

    #[test]
    fn test_no_nested_expansion() {
        let mut bag = bag();
        bag.set("outer", "{user}");
        assert_eq!(bag.expand("{outer}").unwrap(), "{user}");
    }

    #[test]
    fn test_unterminated() {
        assert!(bag().expand("oops {user").is_err());
    }
}
