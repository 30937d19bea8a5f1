//! Packed-string framing for multi-field table values.
//!
//! A packed value is a sequence of `<decimal length>:<bytes>` frames. Frames
//! nest: a field may itself be a packed list. Used by the substitute table
//! and the revision index, whose rows carry several fields per list element.

use strata_error::{Result, StrataError};

/// Pack a list of strings into one framed string.
pub fn pack_strings<S: AsRef<str>>(strings: &[S]) -> String {
    let mut out = String::new();
    for s in strings {
        let s = s.as_ref();
        out.push_str(&s.len().to_string());
        out.push(':');
        out.push_str(s);
    }
    out
}

/// Unpack a framed string produced by [`pack_strings`].
pub fn unpack_strings(packed: &str) -> Result<Vec<String>> {
    let bytes = packed.as_bytes();
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let colon = packed[pos..]
            .find(':')
            .map(|i| pos + i)
            .ok_or_else(|| malformed(packed, "missing length delimiter"))?;
        let len: usize = packed[pos..colon]
            .parse()
            .map_err(|_| malformed(packed, "bad length prefix"))?;
        let start = colon + 1;
        let end = start + len;
        if end > bytes.len() || !packed.is_char_boundary(start) || !packed.is_char_boundary(end) {
            return Err(malformed(packed, "frame overruns value"));
        }
        out.push(packed[start..end].to_owned());
        pos = end;
    }
    Ok(out)
}

fn malformed(packed: &str, detail: &str) -> StrataError {
    StrataError::MalformedSubstitute {
        detail: format!("{detail} in `{packed}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let fields = ["2", "/s/store/abc-x.recipe", "fetch", ""];
        let packed = pack_strings(&fields);
        assert_eq!(unpack_strings(&packed).unwrap(), fields);
    }

    #[test]
    fn nested_frames_roundtrip() {
        let args = pack_strings(&["--url", "http://cache/x"]);
        let outer = pack_strings(&["2", "deriver", "fetch", &args]);
        let fields = unpack_strings(&outer).unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(
            unpack_strings(&fields[3]).unwrap(),
            vec!["--url".to_owned(), "http://cache/x".to_owned()]
        );
    }

    #[test]
    fn empty_value_unpacks_to_nothing() {
        assert!(unpack_strings("").unwrap().is_empty());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(unpack_strings("5:ab").is_err());
        assert!(unpack_strings("x:ab").is_err());
        assert!(unpack_strings("3ab").is_err());
    }
}
