use super::{Limit, LimitSet, Polarity};

/// Database limits over `db` and `db/table` resources.
///
/// A `db` pattern covers all of that database's tables; a `db/table` pattern
/// overrides it for one table. A database is also admitted when a positive
/// table pattern names it, since the table cannot be restored without it.
#[derive(Debug, Clone, Default)]
pub struct DbFilter {
    set: LimitSet,
}

impl DbFilter {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = LimitSet::default();
        for token in tokens {
            let mut limit = Limit::parse(token.as_ref());
            limit.pattern = limit.pattern.trim_matches('/').to_string();
            set.push(limit);
        }
        Self { set }
    }

    /// `resource` is `db` or `db/table`
    pub fn matches(&self, resource: &str) -> bool {
        let resource = resource.trim_matches('/');
        if let Some(polarity) = self.set.resolve(resource) {
            return polarity == Polarity::Include;
        }

        if !resource.contains('/') && self.has_included_table(resource) {
            return true;
        }

        self.set.default_included()
    }

    /// Table-level limits for one database: (table, polarity)
    pub fn tables(&self, database: &str) -> Vec<(&str, Polarity)> {
        self.set
            .limits
            .iter()
            .filter_map(|l| {
                let (db, table) = l.pattern.split_once('/')?;
                (db == database).then_some((table, l.polarity))
            })
            .collect()
    }

    fn has_included_table(&self, database: &str) -> bool {
        self.tables(database)
            .iter()
            .any(|(_, polarity)| *polarity == Polarity::Include)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclude_single_table() {
        let filter = DbFilter::new(["-mydb/secrets"]);
        assert!(!filter.matches("mydb/secrets"));
        assert!(filter.matches("mydb/users"));
        assert!(filter.matches("mydb"));
    }

    #[test]
    fn test_include_database_except_table() {
        let filter = DbFilter::new(["shop", "-shop/sessions"]);
        assert!(filter.matches("shop"));
        assert!(filter.matches("shop/orders"));
        assert!(!filter.matches("shop/sessions"));
        assert!(!filter.matches("blog"));
    }

    #[test]
    fn test_positive_table_admits_database() {
        let filter = DbFilter::new(["shop/orders"]);
        assert!(filter.matches("shop"));
        assert!(filter.matches("shop/orders"));
        assert!(!filter.matches("shop/sessions"));
        assert!(!filter.matches("blog"));
    }

    #[test]
    fn test_tables_listing() {
        let filter = DbFilter::new(["shop/orders", "-shop/sessions", "blog"]);
        assert_eq!(
            filter.tables("shop"),
            vec![("orders", Polarity::Include), ("sessions", Polarity::Exclude)]
        );
        assert!(filter.tables("blog").is_empty());
    }
}
