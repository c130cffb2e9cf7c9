//! Parsing and formatting of kernel-style CPU lists (`0-3,7,9-10`).
//!
//! The same syntax appears in sysfs (`node<N>/cpulist`) and in the
//! runtime's accessible/inaccessible CPU configuration options.

#[derive(Debug, PartialEq, Eq)]
pub struct ParseError {
    input: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid CPU list: {:?}", self.input)
    }
}

impl std::error::Error for ParseError {}

/// Parse a CPU list such as `0-3,7`. Returns a sorted, deduplicated list.
/// An empty or whitespace-only string parses to an empty list.
pub fn parse(input: &str) -> Result<Vec<u32>, ParseError> {
    let err = || ParseError {
        input: input.to_string(),
    };

    let mut cpus = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| err())?;
                let hi: u32 = hi.trim().parse().map_err(|_| err())?;
                if lo > hi {
                    return Err(err());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| err())?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// Format a CPU list back into the compact `0-3,7` form, mainly for logs.
pub fn format(cpus: &[u32]) -> String {
    let mut sorted = cpus.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts: Vec<String> = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let start = sorted[i];
        let mut end = start;
        while i + 1 < sorted.len() && sorted[i + 1] == end + 1 {
            end = sorted[i + 1];
            i += 1;
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
        i += 1;
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single() {
        assert_eq!(parse("3").unwrap(), vec![3]);
    }

    #[test]
    fn test_parse_ranges_and_singles() {
        assert_eq!(parse("0-3,7,9-10").unwrap(), vec![0, 1, 2, 3, 7, 9, 10]);
    }

    #[test]
    fn test_parse_dedups_and_sorts() {
        assert_eq!(parse("7,0-2,1").unwrap(), vec![0, 1, 2, 7]);
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse("").unwrap(), Vec::<u32>::new());
        assert_eq!(parse("  ").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("a").is_err());
        assert!(parse("3-1").is_err());
        assert!(parse("1-").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for list in ["0-3,7,9-10", "0", "2,4,6"] {
            let cpus = parse(list).unwrap();
            assert_eq!(format(&cpus), list);
        }
    }
}
