// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::Path;

use glob::{MatchOptions, Pattern};

use crate::{Error, Result};

/// Selects the paths, relative to the mount, whose content is transformed
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    patterns: Vec<Pattern>,
}

impl PathFilter {
    /// A filter that accepts every path
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a filter from glob patterns, accepting a path if any match
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Pattern::new(p).map_err(|err| Error::InvalidPattern(p.to_owned(), err))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, path: &Path) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        // '*' is allowed to cross directories so that
        // simple patterns like '*.txt' apply at any depth
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.patterns
            .iter()
            .any(|p| p.matches_path_with(path, options))
    }
}

#[cfg(test)]
mod filter_test {
    use std::path::Path;

    use rstest::rstest;

    use super::PathFilter;

    #[rstest]
    #[case(&[], "any/file.bin", true)]
    #[case(&["*.txt"], "a.txt", true)]
    #[case(&["*.txt"], "nested/dir/a.txt", true)]
    #[case(&["*.txt"], "a.md", false)]
    #[case(&["docs/*", "*.txt"], "docs/readme.md", true)]
    #[case(&["docs/*"], "src/readme.md", false)]
    fn test_filter_matches(#[case] patterns: &[&str], #[case] path: &str, #[case] expected: bool) {
        let filter = PathFilter::new(patterns).unwrap();
        assert_eq!(filter.matches(Path::new(path)), expected);
    }

    #[rstest]
    fn test_filter_invalid_pattern() {
        PathFilter::new(["[unclosed"]).expect_err("should reject an invalid glob");
    }
}
