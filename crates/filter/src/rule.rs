use crate::error::{ErrorKind, Result};
use crate::{external, value};
use exn::ResultExt;
use fastdbfs_storage::DirEntry;
use globset::{GlobBuilder, GlobMatcher};
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Prefix turning any rule into an exclusion.
pub const EXCLUDE_PREFIX: &str = "exclude-";

/// What a rule looks at and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Shell glob against the basename (`name`, `iname`)
    NameGlob,
    /// Regular expression searched in the basename (`re`, `ire`)
    RegexBasename,
    /// Regular expression searched in the path relative to the walk root (`wholere`, `iwholere`)
    RegexRelpath,
    MinSize,
    MaxSize,
    /// Modified strictly after the reference instant
    Newer,
    /// Modified strictly before the reference instant
    Older,
    /// User command; exit status zero is a match
    External,
}
impl RuleKind {
    /// Map an option name (without the exclusion prefix) to a kind and its
    /// case sensitivity.
    fn from_option(option: &str) -> Option<(Self, bool)> {
        Some(match option {
            "name" => (Self::NameGlob, false),
            "iname" => (Self::NameGlob, true),
            "re" | "regexp" => (Self::RegexBasename, false),
            "ire" | "iregexp" => (Self::RegexBasename, true),
            "wholere" | "whole-regexp" => (Self::RegexRelpath, false),
            "iwholere" | "iwhole-regexp" => (Self::RegexRelpath, true),
            "min-size" => (Self::MinSize, false),
            "max-size" => (Self::MaxSize, false),
            "newer-than" | "newer" => (Self::Newer, false),
            "older-than" | "older" => (Self::Older, false),
            "external-filter" | "ext-filter" => (Self::External, false),
            _ => return None,
        })
    }

    /// Every option name accepted on the command line, exclusions included.
    pub fn option_names() -> impl Iterator<Item = String> {
        const NAMES: [&str; 18] = [
            "name",
            "iname",
            "re",
            "regexp",
            "ire",
            "iregexp",
            "wholere",
            "whole-regexp",
            "iwholere",
            "iwhole-regexp",
            "min-size",
            "max-size",
            "newer-than",
            "newer",
            "older-than",
            "older",
            "external-filter",
            "ext-filter",
        ];
        NAMES.into_iter().flat_map(|name| [name.to_string(), format!("{EXCLUDE_PREFIX}{name}")])
    }

    /// Relative evaluation cost; cheaper rules run first.
    fn cost(self) -> u8 {
        match self {
            Self::MinSize | Self::MaxSize | Self::Newer | Self::Older => 0,
            Self::NameGlob | Self::RegexBasename | Self::RegexRelpath => 1,
            Self::External => 2,
        }
    }
}

/// An uncompiled rule as given on the command line, e.g. `exclude-iname=*.tmp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub option: String,
    pub value: String,
}
impl RuleSpec {
    pub fn new(option: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            option: option.into(),
            value: value.into(),
        }
    }
}
impl FromStr for RuleSpec {
    type Err = crate::error::Error;

    /// Parse `option=value`; leading dashes on the option are ignored.
    fn from_str(s: &str) -> Result<Self> {
        let Some((option, value)) = s.split_once('=') else {
            exn::bail!(ErrorKind::UnknownRule(s.trim_start_matches('-').to_string()));
        };
        Ok(Self::new(option.trim_start_matches('-'), value))
    }
}
impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "--{}={}", self.option, self.value)
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Glob(GlobMatcher),
    Basename(Regex),
    Relpath(Regex),
    MinSize(u64),
    MaxSize(u64),
    Newer(OffsetDateTime),
    Older(OffsetDateTime),
    External(String),
}

/// A compiled, immutable rule.
#[derive(Debug, Clone)]
pub struct Rule {
    kind: RuleKind,
    pattern: String,
    case_insensitive: bool,
    negated: bool,
    matcher: Matcher,
}
impl Rule {
    /// Compile one rule. Time rules resolve their reference instant against `now`.
    pub fn compile(spec: &RuleSpec, now: OffsetDateTime) -> Result<Self> {
        let (negated, option) = match spec.option.strip_prefix(EXCLUDE_PREFIX) {
            Some(option) => (true, option),
            None => (false, spec.option.as_str()),
        };
        let (kind, case_insensitive) =
            RuleKind::from_option(option).ok_or_else(|| ErrorKind::UnknownRule(spec.option.clone()))?;
        let invalid = || ErrorKind::invalid(&spec.option, &spec.value);

        let matcher = match kind {
            RuleKind::NameGlob => Matcher::Glob(glob(&spec.value, case_insensitive).or_raise(invalid)?),
            RuleKind::RegexBasename => Matcher::Basename(regex(&spec.value, case_insensitive).or_raise(invalid)?),
            RuleKind::RegexRelpath => Matcher::Relpath(regex(&spec.value, case_insensitive).or_raise(invalid)?),
            RuleKind::MinSize => Matcher::MinSize(value::parse_size(&spec.value).ok_or_else(invalid)?),
            RuleKind::MaxSize => Matcher::MaxSize(value::parse_size(&spec.value).ok_or_else(invalid)?),
            RuleKind::Newer => Matcher::Newer(value::parse_time(&spec.value, now).ok_or_else(invalid)?),
            RuleKind::Older => Matcher::Older(value::parse_time(&spec.value, now).ok_or_else(invalid)?),
            RuleKind::External if spec.value.trim().is_empty() => exn::bail!(invalid()),
            RuleKind::External => Matcher::External(spec.value.clone()),
        };
        Ok(Self {
            kind,
            pattern: spec.value.clone(),
            case_insensitive,
            negated,
            matcher,
        })
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    /// Whether the rule's condition holds for `entry`, ignoring negation.
    ///
    /// `None` means the rule does not apply: size rules never look at
    /// directories.
    pub fn test(&self, entry: &DirEntry) -> Option<bool> {
        match &self.matcher {
            Matcher::Glob(glob) => Some(glob.is_match(entry.basename())),
            Matcher::Basename(re) => Some(re.is_match(&entry.basename())),
            Matcher::Relpath(re) => Some(re.is_match(&entry.relpath)),
            Matcher::MinSize(min) => (!entry.is_dir()).then(|| entry.size() >= *min),
            Matcher::MaxSize(max) => (!entry.is_dir()).then(|| entry.size() <= *max),
            Matcher::Newer(instant) => Some(entry.modified() > *instant),
            Matcher::Older(instant) => Some(entry.modified() < *instant),
            Matcher::External(command) => Some(external::matches(command, entry)),
        }
    }

    pub(crate) fn cost(&self) -> u8 {
        self.kind.cost()
    }
}

/// Only `*`, `?` and `[...]` classes are special; braces match literally.
fn glob(pattern: &str, case_insensitive: bool) -> std::result::Result<GlobMatcher, globset::Error> {
    let pattern = pattern.replace('{', r"\{").replace('}', r"\}");
    let glob = GlobBuilder::new(&pattern)
        .case_insensitive(case_insensitive)
        .literal_separator(true)
        .backslash_escape(true)
        .build()?;
    Ok(glob.compile_matcher())
}

fn regex(pattern: &str, case_insensitive: bool) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(case_insensitive).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastdbfs_storage::FileInfo;
    use rstest::rstest;

    const NOW: OffsetDateTime = time::macros::datetime!(2024-06-01 12:00 UTC);

    fn file(relpath: &str, size: u64) -> DirEntry {
        DirEntry::new(relpath, FileInfo::file(relpath, size, NOW))
    }

    fn compile(option: &str, value: &str) -> Rule {
        Rule::compile(&RuleSpec::new(option, value), NOW).unwrap()
    }

    #[rstest]
    #[case("name", RuleKind::NameGlob, false, false)]
    #[case("iname", RuleKind::NameGlob, true, false)]
    #[case("exclude-iname", RuleKind::NameGlob, true, true)]
    #[case("regexp", RuleKind::RegexBasename, false, false)]
    #[case("exclude-ire", RuleKind::RegexBasename, true, true)]
    #[case("whole-regexp", RuleKind::RegexRelpath, false, false)]
    #[case("exclude-iwholere", RuleKind::RegexRelpath, true, true)]
    #[case("min-size", RuleKind::MinSize, false, false)]
    #[case("newer", RuleKind::Newer, false, false)]
    #[case("exclude-older-than", RuleKind::Older, false, true)]
    #[case("ext-filter", RuleKind::External, false, false)]
    fn test_option_names(#[case] option: &str, #[case] kind: RuleKind, #[case] insensitive: bool, #[case] negated: bool) {
        let value = match kind {
            RuleKind::MinSize | RuleKind::MaxSize => "1K",
            RuleKind::Newer | RuleKind::Older => "yesterday",
            _ => "x",
        };
        let rule = compile(option, value);
        assert_eq!(rule.kind(), kind);
        assert_eq!(rule.is_case_insensitive(), insensitive);
        assert_eq!(rule.is_negated(), negated);
        assert_eq!(rule.pattern(), value);
    }

    #[test]
    fn test_unknown_rule() {
        let err = Rule::compile(&RuleSpec::new("colour", "red"), NOW).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownRule(name) if name == "colour"));
    }

    #[rstest]
    #[case("re", "(unclosed")]
    #[case("name", "[unclosed")]
    #[case("iwholere", "[z-a]")]
    #[case("min-size", "big")]
    #[case("max-size", "")]
    #[case("newer-than", "the day before")]
    #[case("external-filter", "  ")]
    fn test_invalid_values(#[case] option: &str, #[case] value: &str) {
        let err = Rule::compile(&RuleSpec::new(option, value), NOW).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPattern { rule, .. } if rule == option));
    }

    #[rstest]
    #[case("*.jpg", "photo.jpg", true)]
    #[case("*.jpg", "photo.jpg.bak", false)]
    #[case("*.jpg", "photo.JPG", false)]
    #[case("photo.?pg", "photo.jpg", true)]
    #[case("photo.?pg", "photo.pg", false)]
    #[case("data-[0-9].csv", "data-7.csv", true)]
    #[case("data-[0-9].csv", "data-x.csv", false)]
    #[case("data-[!0-9].csv", "data-x.csv", true)]
    #[case("data-[!0-9].csv", "data-1.csv", false)]
    #[case("[]]x", "]x", true)]
    #[case("[a-]x", "-x", true)]
    #[case("{a,b}.txt", "{a,b}.txt", true)]
    #[case("{a,b}.txt", "a.txt", false)]
    #[case("a+b(1).txt", "a+b(1).txt", true)]
    #[case(r"\*.txt", "*.txt", true)]
    #[case(r"\*.txt", "a.txt", false)]
    #[case("*", "anything", true)]
    fn test_name_glob(#[case] pattern: &str, #[case] name: &str, #[case] expected: bool) {
        assert_eq!(compile("name", pattern).test(&file(name, 1)), Some(expected), "{pattern} vs {name}");
    }

    #[test]
    fn test_name_glob_only_sees_the_basename() {
        assert_eq!(compile("name", "*.jpg").test(&file("a/b/photo.jpg", 1)), Some(true));
        assert_eq!(compile("name", "b*").test(&file("b/photo.jpg", 1)), Some(false));
    }

    #[rstest]
    #[case("photo.jpg", true)]
    #[case("PHOTO.JPG", true)]
    #[case("photo.jpeg", false)]
    fn test_iname(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(compile("iname", "*.JPG").test(&file(name, 1)), Some(expected));
    }

    #[test]
    fn test_case_insensitive_regex_keeps_escapes() {
        let rule = compile("ire", r"^IMG_\d+\.JPE?G$");
        assert_eq!(rule.test(&file("img_0042.jpeg", 1)), Some(true));
        assert_eq!(rule.test(&file("IMG_X.JPG", 1)), Some(false));
    }

    #[test]
    fn test_regex_searches() {
        assert_eq!(compile("re", "tmp").test(&file("a/mytmpfile", 1)), Some(true));
        assert_eq!(compile("re", "^a").test(&file("a/b.txt", 1)), Some(false));
        assert_eq!(compile("wholere", "^a/").test(&file("a/b.txt", 1)), Some(true));
    }

    #[test]
    fn test_size_rules() {
        let min = compile("min-size", "100");
        let max = compile("max-size", "100");
        assert_eq!(min.test(&file("f", 100)), Some(true));
        assert_eq!(min.test(&file("f", 99)), Some(false));
        assert_eq!(max.test(&file("f", 100)), Some(true));
        assert_eq!(max.test(&file("f", 101)), Some(false));
        let dir = DirEntry::new("d", FileInfo::dir("d", NOW));
        assert_eq!(min.test(&dir), None);
        assert_eq!(max.test(&dir), None);
    }

    #[test]
    fn test_time_rules_are_strict() {
        let at = |modified| DirEntry::new("f", FileInfo::file("f", 1, modified));
        let newer = compile("newer-than", "2024-05-01");
        let older = compile("older-than", "2024-05-01");
        let boundary = time::macros::datetime!(2024-05-01 0:00 UTC);
        assert_eq!(newer.test(&at(boundary)), Some(false));
        assert_eq!(older.test(&at(boundary)), Some(false));
        assert_eq!(newer.test(&at(boundary + time::Duration::SECOND)), Some(true));
        assert_eq!(older.test(&at(boundary - time::Duration::SECOND)), Some(true));
    }

    #[rstest]
    #[case("--iname=*.jpg", "iname", "*.jpg")]
    #[case("exclude-wholere=a=b", "exclude-wholere", "a=b")]
    #[case("min-size=", "min-size", "")]
    fn test_spec_from_str(#[case] input: &str, #[case] option: &str, #[case] value: &str) {
        let spec: RuleSpec = input.parse().unwrap();
        assert_eq!(spec, RuleSpec::new(option, value));
    }

    #[test]
    fn test_spec_without_value() {
        assert!("iname".parse::<RuleSpec>().is_err());
    }

    #[test]
    fn test_option_names_include_exclusions() {
        let names: Vec<_> = RuleKind::option_names().collect();
        assert_eq!(names.len(), 36);
        assert!(names.contains(&"exclude-ext-filter".to_string()));
    }
}
