//! Restore limits: user supplied inclusion/exclusion tokens.
//!
//! A limit token is `-?/path` for the filesystem or `-?mysql:db[/table]` /
//! `-?pgsql:db[/table]` for databases. A leading `-` excludes, a leading `+`
//! or nothing includes. `Limits` holds the raw tokens and hands out the
//! filesystem and per-engine database filters.

mod db_filter;
mod path_filter;

pub use db_filter::DbFilter;
pub use path_filter::PathFilter;

use std::fs;
use std::io;
use std::path::Path;

use crate::utils::errors::{RestoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Include,
    Exclude,
}

/// A parsed limit token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit {
    pub polarity: Polarity,
    pub pattern: String,
}

impl Limit {
    pub fn parse(token: &str) -> Self {
        if let Some(pattern) = token.strip_prefix('-') {
            Limit {
                polarity: Polarity::Exclude,
                pattern: pattern.to_string(),
            }
        } else {
            Limit {
                polarity: Polarity::Include,
                pattern: token.strip_prefix('+').unwrap_or(token).to_string(),
            }
        }
    }
}

/// Longest-match resolution over hierarchical `/`-separated patterns.
///
/// Shared by the path and database filters; each normalizes its patterns and
/// candidates before handing them here.
#[derive(Debug, Clone, Default)]
struct LimitSet {
    limits: Vec<Limit>,
}

impl LimitSet {
    fn push(&mut self, limit: Limit) {
        self.limits.push(limit);
    }

    fn has_includes(&self) -> bool {
        self.limits.iter().any(|l| l.polarity == Polarity::Include)
    }

    /// Polarity of the longest pattern covering `candidate`.
    ///
    /// On an exact tie between opposite polarities, exclusion wins so the
    /// outcome does not depend on token order.
    fn resolve(&self, candidate: &str) -> Option<Polarity> {
        let mut best: Option<&Limit> = None;
        for limit in &self.limits {
            if !covers(&limit.pattern, candidate) {
                continue;
            }
            best = match best {
                None => Some(limit),
                Some(current) if limit.pattern.len() > current.pattern.len() => Some(limit),
                Some(current)
                    if limit.pattern.len() == current.pattern.len()
                        && limit.polarity == Polarity::Exclude =>
                {
                    Some(limit)
                }
                keep => keep,
            };
        }
        best.map(|l| l.polarity)
    }

    /// Included when nothing matches and no include pattern exists
    fn default_included(&self) -> bool {
        !self.has_includes()
    }
}

/// Does hierarchical `pattern` cover `candidate` (itself or a descendant)?
fn covers(pattern: &str, candidate: &str) -> bool {
    if pattern == "/" {
        return candidate.starts_with('/');
    }
    match candidate.strip_prefix(pattern) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Database engines whose limits use a `<namespace>:` token prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbNamespace {
    Mysql,
    Pgsql,
}

impl DbNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            DbNamespace::Mysql => "mysql:",
            DbNamespace::Pgsql => "pgsql:",
        }
    }

    pub fn from_engine(engine: &str) -> Option<Self> {
        match engine {
            "mysql" => Some(DbNamespace::Mysql),
            "pgsql" | "postgresql" => Some(DbNamespace::Pgsql),
            _ => None,
        }
    }
}

/// The complete set of limit tokens for a restore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Limits {
    tokens: Vec<String>,
}

impl Limits {
    /// Parse and validate limit tokens
    pub fn parse<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut limits = Limits::default();
        for token in tokens {
            let token = token.as_ref().trim();
            if !is_legal(token) {
                return Err(RestoreError::Config(format!(
                    "{:?} is not a legal limit",
                    token
                )));
            }
            limits.tokens.push(token.to_string());
        }
        Ok(limits)
    }

    /// Read limits from an overrides file: one token per line, `#` comments.
    /// A missing file yields no limits.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        let tokens = content
            .lines()
            .map(|line| line.split('#').next().unwrap_or("").trim())
            .filter(|line| !line.is_empty());

        Self::parse(tokens)
    }

    /// Append another set of limits (e.g. command line after overrides)
    pub fn extend(&mut self, other: Limits) {
        self.tokens.extend(other.tokens);
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Database namespaces named by any token, in first-seen order
    pub fn db_namespaces(&self) -> Vec<DbNamespace> {
        let mut namespaces = Vec::new();
        for (ns, _, _) in self.tokens.iter().filter_map(|t| db_token(t)) {
            if !namespaces.contains(&ns) {
                namespaces.push(ns);
            }
        }
        namespaces
    }

    /// Filesystem filter built from the path tokens
    pub fn fs(&self) -> PathFilter {
        PathFilter::new(self.tokens.iter().filter(|t| db_token(t).is_none()))
    }

    /// Database filter for one engine namespace, prefix stripped.
    ///
    /// For mysql, any positive limit also admits the `mysql` system database
    /// so users and grants come along with the included databases.
    pub fn db(&self, namespace: DbNamespace) -> DbFilter {
        let mut tokens: Vec<String> = self
            .tokens
            .iter()
            .filter_map(|t| {
                let (ns, negative, rest) = db_token(t)?;
                if ns != namespace {
                    return None;
                }
                Some(if negative {
                    format!("-{}", rest)
                } else {
                    rest.to_string()
                })
            })
            .collect();

        if namespace == DbNamespace::Mysql && tokens.iter().any(|t| !t.starts_with('-')) {
            tokens.push("mysql".to_string());
        }

        DbFilter::new(tokens)
    }
}

fn is_legal(token: &str) -> bool {
    let body = token
        .strip_prefix('-')
        .or_else(|| token.strip_prefix('+'))
        .unwrap_or(token);
    body.starts_with('/') || db_token(token).is_some()
}

/// Split a database token into (namespace, negative, `db[/table]`)
fn db_token(token: &str) -> Option<(DbNamespace, bool, &str)> {
    let (negative, body) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    for ns in [DbNamespace::Mysql, DbNamespace::Pgsql] {
        if let Some(rest) = body.strip_prefix(ns.prefix()) {
            return Some((ns, negative, rest));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_limit_parse_polarity() {
        assert_eq!(
            Limit::parse("-/var/log"),
            Limit {
                polarity: Polarity::Exclude,
                pattern: "/var/log".to_string()
            }
        );
        assert_eq!(Limit::parse("+/var").polarity, Polarity::Include);
        assert_eq!(Limit::parse("/var").polarity, Polarity::Include);
    }

    #[test]
    fn test_covers_component_boundary() {
        assert!(covers("/var", "/var"));
        assert!(covers("/var", "/var/log/x"));
        assert!(!covers("/var", "/varnish"));
        assert!(covers("/", "/etc"));
        assert!(covers("db", "db/table"));
        assert!(!covers("db", "dbx/table"));
    }

    #[test]
    fn test_illegal_limit_rejected() {
        assert!(Limits::parse(["relative/path"]).is_err());
        assert!(Limits::parse(["oracle:db"]).is_err());
        assert!(Limits::parse(["-/var", "mysql:db/t", "-pgsql:x"]).is_ok());
    }

    #[test]
    fn test_split_fs_and_db() -> Result<()> {
        let limits = Limits::parse(["/var", "-/var/log", "mysql:shop", "-mysql:shop/sessions"])?;

        let fs = limits.fs();
        assert!(fs.matches("/var/lib/x"));
        assert!(!fs.matches("/var/log/x"));

        let db = limits.db(DbNamespace::Mysql);
        assert!(db.matches("shop"));
        assert!(!db.matches("shop/sessions"));
        assert!(db.matches("mysql"));
        assert!(!db.matches("other"));

        let pg = limits.db(DbNamespace::Pgsql);
        assert!(pg.matches("anything"));
        Ok(())
    }

    #[test]
    fn test_db_namespaces() -> Result<()> {
        let limits = Limits::parse(["/etc", "-pgsql:app", "mysql:shop", "pgsql:app/users"])?;
        assert_eq!(
            limits.db_namespaces(),
            vec![DbNamespace::Pgsql, DbNamespace::Mysql]
        );
        assert!(Limits::parse(["/etc"])?.db_namespaces().is_empty());
        Ok(())
    }

    #[test]
    fn test_negative_only_mysql_limits_add_nothing() -> Result<()> {
        let limits = Limits::parse(["-mysql:logs"])?;
        let db = limits.db(DbNamespace::Mysql);
        assert!(!db.matches("logs"));
        assert!(db.matches("shop"));
        Ok(())
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("overrides");
        std::fs::write(&path, "# comment\n/srv # trailing\n\n-/srv/cache\n")?;

        let limits = Limits::from_file(&path)?;
        assert_eq!(limits.tokens(), ["/srv", "-/srv/cache"]);

        let missing = Limits::from_file(&temp_dir.path().join("missing"))?;
        assert!(missing.is_empty());
        Ok(())
    }

    #[test]
    fn test_from_file_rejects_illegal() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("overrides");
        std::fs::write(&path, "srv\n")?;

        assert!(matches!(Limits::from_file(&path), Err(RestoreError::Config(_))));
        Ok(())
    }
}
