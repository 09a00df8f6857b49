use super::CdiError;
use std::fmt;

/// A fully qualified CDI device name, `vendor/class=name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    vendor: String,
    class: String,
    name: String,
}

impl QualifiedName {
    pub fn parse(input: &str) -> Result<Self, CdiError> {
        let invalid = |reason: String| CdiError::InvalidName {
            name: input.to_owned(),
            reason,
        };
        let (kind, name) = input
            .split_once('=')
            .ok_or_else(|| invalid("missing '=' between kind and device name".to_owned()))?;
        let (vendor, class) = parse_kind(kind).map_err(invalid)?;
        validate_device_name(name).map_err(invalid)?;
        Ok(Self {
            vendor: vendor.to_owned(),
            class: class.to_owned(),
            name: name.to_owned(),
        })
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `vendor/class`.
    pub fn kind(&self) -> String {
        format!("{}/{}", self.vendor, self.class)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}={}", self.vendor, self.class, self.name)
    }
}

/// Split and validate a `vendor/class` kind.
pub(crate) fn parse_kind(kind: &str) -> Result<(&str, &str), String> {
    let (vendor, class) = kind
        .split_once('/')
        .ok_or_else(|| format!("kind '{kind}' is not of the form vendor/class"))?;
    validate_vendor(vendor)?;
    validate_class(class)?;
    Ok((vendor, class))
}

fn validate_vendor(vendor: &str) -> Result<(), String> {
    validate_part("vendor", vendor, |c| matches!(c, '-' | '_' | '.'), false)
}

fn validate_class(class: &str) -> Result<(), String> {
    validate_part("class", class, |c| matches!(c, '-' | '_'), false)
}

pub(crate) fn validate_device_name(name: &str) -> Result<(), String> {
    validate_part("device name", name, |c| matches!(c, '-' | '_' | '.' | ':'), true)
}

fn validate_part(
    what: &str,
    value: &str,
    extra: impl Fn(char) -> bool,
    digit_first: bool,
) -> Result<(), String> {
    let Some(first) = value.chars().next() else {
        return Err(format!("empty {what}"));
    };
    let first_ok = if digit_first {
        first.is_ascii_alphanumeric()
    } else {
        first.is_ascii_alphabetic()
    };
    if !first_ok {
        let expected = if digit_first { "a letter or digit" } else { "a letter" };
        return Err(format!("{what} '{value}' must start with {expected}"));
    }
    if let Some(bad) = value
        .chars()
        .find(|&c| !c.is_ascii_alphanumeric() && !extra(c))
    {
        return Err(format!("invalid character '{bad}' in {what} '{value}'"));
    }
    if !value.ends_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(format!("{what} '{value}' must end with a letter or digit"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_names() {
        let q = QualifiedName::parse("vendor.example.org/gpu=0").unwrap();
        assert_eq!(q.vendor(), "vendor.example.org");
        assert_eq!(q.class(), "gpu");
        assert_eq!(q.name(), "0");
        assert_eq!(q.kind(), "vendor.example.org/gpu");
        assert_eq!(q.to_string(), "vendor.example.org/gpu=0");

        assert!(QualifiedName::parse("nvidia.com/gpu=GPU-1234:mig.5").is_ok());
        assert!(QualifiedName::parse("a/b_c-d=all").is_ok());
    }

    #[test]
    fn rejects_missing_parts() {
        for bad in ["vendor.com/gpu", "gpu=0", "/gpu=0", "vendor.com/=0", "vendor.com/gpu="] {
            assert!(QualifiedName::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn rejects_bad_characters() {
        for bad in [
            "1vendor.com/gpu=0",
            "vendor.com-/gpu=0",
            "vendor.com/gpu.x=0",
            "vendor.com/9gpu=0",
            "vendor.com/gpu=-0",
            "vendor.com/gpu=0.",
            "vendor.com/gpu=a/b",
            "vendor com/gpu=0",
        ] {
            let err = QualifiedName::parse(bad).unwrap_err();
            assert!(matches!(err, CdiError::InvalidName { .. }), "{bad}");
        }
    }

    #[test]
    fn error_names_input() {
        let err = QualifiedName::parse("bogus").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
