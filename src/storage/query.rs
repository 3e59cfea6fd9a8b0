//! Composable SQL generation for the filter/sort surface.
//!
//! All filter and sort combinations reach SQLite through this builder. For
//! a given input it emits byte-identical SQL (stable identifiers, fixed
//! clause order) so prepared-statement caches stay warm, with positional
//! parameters collected in clause order.

use rusqlite::types::Value;

/// Maximum values expanded into a single `IN (...)` list.
pub(crate) const IN_LIST_CAP: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Asc,
    Desc,
}

impl Dir {
    fn keyword(self) -> &'static str {
        match self {
            Dir::Asc => "ASC",
            Dir::Desc => "DESC",
        }
    }

    /// Comparison selecting rows strictly after a cursor value.
    fn after_op(self) -> &'static str {
        match self {
            Dir::Asc => ">",
            Dir::Desc => "<",
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Query {
    ctes: Vec<(String, String)>,
    select: Vec<String>,
    from: String,
    joins: Vec<String>,
    wheres: Vec<String>,
    order_by: Vec<String>,
    limit: Option<usize>,
    params: Vec<Value>,
}

impl Query {
    pub(crate) fn new(from: impl Into<String>) -> Self {
        Query {
            from: from.into(),
            ..Default::default()
        }
    }

    pub(crate) fn with_cte(&mut self, name: impl Into<String>, sql: impl Into<String>) -> &mut Self {
        self.ctes.push((name.into(), sql.into()));
        self
    }

    pub(crate) fn select(&mut self, column: impl Into<String>) -> &mut Self {
        self.select.push(column.into());
        self
    }

    pub(crate) fn join(&mut self, join: impl Into<String>) -> &mut Self {
        self.joins.push(join.into());
        self
    }

    /// Add a WHERE fragment with no parameters.
    pub(crate) fn filter(&mut self, clause: impl Into<String>) -> &mut Self {
        self.wheres.push(clause.into());
        self
    }

    /// Add a WHERE fragment together with its parameters, in order.
    pub(crate) fn filter_with<I>(&mut self, clause: impl Into<String>, params: I) -> &mut Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.wheres.push(clause.into());
        self.params.extend(params);
        self
    }

    /// Bind a parameter referenced by an already-added fragment.
    pub(crate) fn param(&mut self, value: Value) -> &mut Self {
        self.params.push(value);
        self
    }

    /// `column IN (?, ...)`, capped at [`IN_LIST_CAP`] values.
    ///
    /// Callers with more values chunk at a higher level.
    pub(crate) fn filter_in<I>(&mut self, column: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = Value>,
    {
        let values: Vec<Value> = values.into_iter().take(IN_LIST_CAP).collect();
        if values.is_empty() {
            self.wheres.push("0".to_string());
            return self;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.wheres.push(format!("{} IN ({})", column, placeholders));
        self.params.extend(values);
        self
    }

    pub(crate) fn order(&mut self, expr: impl Into<String>) -> &mut Self {
        self.order_by.push(expr.into());
        self
    }

    pub(crate) fn limit(&mut self, limit: usize) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    /// Order by the given sort keys and, with a cursor, restrict to rows
    /// strictly after it.
    ///
    /// The cursor comparison is the expanded lexicographic form
    /// `k1 > v1 OR (k1 = v1 AND (k2 > v2 OR ...))` with each comparison
    /// direction taken from the key's sort direction.
    pub(crate) fn keyset(&mut self, keys: &[(&str, Dir)], cursor: Option<Vec<Value>>) -> &mut Self {
        for (expr, dir) in keys {
            self.order_by.push(format!("{} {}", expr, dir.keyword()));
        }
        if let Some(values) = cursor {
            debug_assert_eq!(values.len(), keys.len());
            let (clause, params) = keyset_after(keys, &values);
            self.wheres.push(clause);
            self.params.extend(params);
        }
        self
    }

    pub(crate) fn sql(&self) -> String {
        let mut sql = String::new();
        if !self.ctes.is_empty() {
            sql.push_str("WITH ");
            let ctes: Vec<String> = self
                .ctes
                .iter()
                .map(|(name, body)| format!("{} AS ({})", name, body))
                .collect();
            sql.push_str(&ctes.join(", "));
            sql.push(' ');
        }
        sql.push_str("SELECT ");
        sql.push_str(&self.select.join(", "));
        sql.push_str(" FROM ");
        sql.push_str(&self.from);
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            let wheres: Vec<String> = self.wheres.iter().map(|w| format!("({})", w)).collect();
            sql.push_str(&wheres.join(" AND "));
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&limit.to_string());
        }
        sql
    }

    pub(crate) fn into_parts(self) -> (String, Vec<Value>) {
        let sql = self.sql();
        (sql, self.params)
    }
}

fn keyset_after(keys: &[(&str, Dir)], values: &[Value]) -> (String, Vec<Value>) {
    let ((expr, dir), value) = (&keys[0], &values[0]);
    if keys.len() == 1 {
        return (
            format!("{} {} ?", expr, dir.after_op()),
            vec![value.clone()],
        );
    }
    let (inner, inner_params) = keyset_after(&keys[1..], &values[1..]);
    let clause = format!(
        "{} {} ? OR ({} = ? AND ({}))",
        expr,
        dir.after_op(),
        expr,
        inner,
    );
    let mut params = vec![value.clone(), value.clone()];
    params.extend(inner_params);
    (clause, params)
}

pub(crate) fn text(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}

pub(crate) fn int(value: i64) -> Value {
    Value::Integer(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_select() {
        let mut q = Query::new("feeds");
        q.select("url").select("title").filter("updates_enabled = 1");
        assert_eq!(
            q.sql(),
            "SELECT url, title FROM feeds WHERE (updates_enabled = 1)"
        );
    }

    #[test]
    fn test_deterministic_output() {
        let build = || {
            let mut q = Query::new("entries");
            q.select("id")
                .filter_with("feed = ?", [text("f")])
                .filter("read = 0")
                .keyset(&[("recent_sort", Dir::Desc), ("id", Dir::Asc)], None)
                .limit(10);
            q.sql()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_keyset_cursor_clause() {
        let mut q = Query::new("entries");
        q.select("id").keyset(
            &[("recent_sort", Dir::Desc), ("id", Dir::Asc)],
            Some(vec![int(100), text("e1")]),
        );
        let (sql, params) = q.into_parts();
        assert!(sql.contains("ORDER BY recent_sort DESC, id ASC"));
        assert!(sql.contains("recent_sort < ? OR (recent_sort = ? AND (id > ?))"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_cte_and_join() {
        let mut q = Query::new("entries");
        q.with_cte("matched", "SELECT id FROM search_entries")
            .select("entries.id")
            .join("JOIN matched ON matched.id = entries.id");
        let sql = q.sql();
        assert!(sql.starts_with("WITH matched AS (SELECT id FROM search_entries) SELECT"));
        assert!(sql.contains("JOIN matched ON matched.id = entries.id"));
    }

    #[test]
    fn test_in_list_empty_matches_nothing() {
        let mut q = Query::new("entries");
        q.select("id").filter_in("id", Vec::<Value>::new());
        assert!(q.sql().contains("(0)"));
    }

    #[test]
    fn test_in_list_expansion() {
        let mut q = Query::new("entries");
        q.select("id")
            .filter_in("id", vec![text("a"), text("b"), text("c")]);
        let (sql, params) = q.into_parts();
        assert!(sql.contains("id IN (?, ?, ?)"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_keyset_params_follow_filter_params() {
        let mut q = Query::new("entries");
        q.select("id")
            .filter_with("feed = ?", [text("f")])
            .keyset(&[("id", Dir::Asc)], Some(vec![text("e1")]));
        let (sql, params) = q.into_parts();
        assert!(sql.contains("(feed = ?) AND (id > ?)"));
        assert_eq!(params, vec![text("f"), text("e1")]);
    }
}
