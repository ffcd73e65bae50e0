use super::{Limit, LimitSet, Polarity};

/// Filesystem path filter with longest-prefix-wins resolution.
///
/// `+/var -/var/log` includes `/var/lib/x`, excludes `/var/log/x`, and
/// excludes `/etc/x` because an include pattern exists and none covers it.
/// An empty filter, or one with only exclusions, includes everything else.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    set: LimitSet,
}

impl PathFilter {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = LimitSet::default();
        for token in tokens {
            let mut limit = Limit::parse(token.as_ref());
            limit.pattern = normalize(&limit.pattern);
            set.push(limit);
        }
        Self { set }
    }

    pub fn is_empty(&self) -> bool {
        self.set.limits.is_empty()
    }

    /// Include patterns, normalized
    pub fn includes(&self) -> impl Iterator<Item = &str> {
        self.set
            .limits
            .iter()
            .filter(|l| l.polarity == Polarity::Include)
            .map(|l| l.pattern.as_str())
    }

    pub fn matches(&self, path: &str) -> bool {
        match self.set.resolve(&normalize(path)) {
            Some(polarity) => polarity == Polarity::Include,
            None => self.set.default_included(),
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
