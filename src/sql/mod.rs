/// Table-name extraction and rewriting
///
/// Statements are scanned for table references after `FROM`, `JOIN`,
/// `UPDATE`, `INTO` and `TABLE`. Keywords inside string literals, comments
/// and backtick identifiers never count, and a keyword only matches as a
/// standalone word. A reference resolved to a sub-table index `n` is
/// renamed `table_n` in place; everything else in the statement is copied
/// through byte for byte.
use crate::error::{KumoError, KumoResult};
use aho_corasick::{AhoCorasick, BuildError};
use fnv::{FnvHashMap, FnvHashSet};
use lazy_static::lazy_static;

const KEYWORDS: &[&str] = &["FROM", "JOIN", "UPDATE", "INTO", "TABLE"];
const KW_FROM: usize = 0;
const KW_JOIN: usize = 1;
const KW_UPDATE: usize = 2;
const KW_INTO: usize = 3;

/// Words that end a table list instead of naming an alias
const CLAUSE_WORDS: &[&str] = &[
    "WHERE", "SET", "JOIN", "INNER", "LEFT", "RIGHT", "OUTER", "CROSS", "NATURAL",
    "STRAIGHT_JOIN", "ON", "USING", "GROUP", "ORDER", "LIMIT", "HAVING", "UNION", "FOR", "LOCK",
    "FORCE", "USE", "IGNORE", "PARTITION", "WINDOW", "VALUES", "VALUE", "SELECT", "INTO",
    "PROCEDURE", "AS",
];

lazy_static! {
    static ref KEYWORD_FINDER: Result<AhoCorasick, BuildError> = AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(KEYWORDS);
}

fn finder() -> KumoResult<&'static AhoCorasick> {
    KEYWORD_FINDER
        .as_ref()
        .map_err(|e| KumoError::execute(format!("keyword finder unavailable: {}", e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Code,
    /// String literal or comment
    Literal,
    /// Backtick-quoted identifier, quotes included
    Quoted,
}

/// Byte range of a name inside the statement, backticks excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A table reference found in a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    pub db: Option<Span>,
    pub table: Span,
}

impl TableRef {
    pub fn db_name<'a>(&self, sql: &'a str) -> Option<&'a str> {
        self.db.map(|s| &sql[s.start..s.end])
    }

    pub fn table_name<'a>(&self, sql: &'a str) -> &'a str {
        &sql[self.table.start..self.table.end]
    }
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn classify(sql: &[u8]) -> Vec<Class> {
    let mut class = vec![Class::Code; sql.len()];
    let mut i = 0;

    while i < sql.len() {
        match sql[i] {
            q @ (b'\'' | b'"') => {
                class[i] = Class::Literal;
                i += 1;
                while i < sql.len() {
                    class[i] = Class::Literal;
                    if sql[i] == b'\\' && i + 1 < sql.len() {
                        class[i + 1] = Class::Literal;
                        i += 2;
                        continue;
                    }
                    if sql[i] == q {
                        if sql.get(i + 1) == Some(&q) {
                            class[i + 1] = Class::Literal;
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            b'`' => {
                class[i] = Class::Quoted;
                i += 1;
                while i < sql.len() {
                    class[i] = Class::Quoted;
                    i += 1;
                    if sql[i - 1] == b'`' {
                        break;
                    }
                }
            }
            b'#' => {
                while i < sql.len() && sql[i] != b'\n' {
                    class[i] = Class::Literal;
                    i += 1;
                }
            }
            b'-' if sql.get(i + 1) == Some(&b'-')
                && sql.get(i + 2).map_or(true, |b| b.is_ascii_whitespace()) =>
            {
                while i < sql.len() && sql[i] != b'\n' {
                    class[i] = Class::Literal;
                    i += 1;
                }
            }
            b'/' if sql.get(i + 1) == Some(&b'*') => {
                class[i] = Class::Literal;
                class[i + 1] = Class::Literal;
                i += 2;
                while i < sql.len() {
                    class[i] = Class::Literal;
                    if sql[i] == b'/' && sql[i - 1] == b'*' && class[i - 1] == Class::Literal {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }

    class
}

struct Scanner<'a> {
    sql: &'a [u8],
    class: &'a [Class],
}

impl<'a> Scanner<'a> {
    fn skip_blank(&self, mut pos: usize) -> usize {
        while pos < self.sql.len()
            && (self.sql[pos].is_ascii_whitespace() || self.class[pos] == Class::Literal)
        {
            pos += 1;
        }
        pos
    }

    /// A bare word starting at `pos`
    fn word(&self, pos: usize) -> Option<(&'a str, usize)> {
        let mut end = pos;
        while end < self.sql.len() && self.class[end] == Class::Code && is_ident(self.sql[end]) {
            end += 1;
        }
        if end == pos {
            return None;
        }
        std::str::from_utf8(&self.sql[pos..end])
            .ok()
            .map(|w| (w, end))
    }

    fn previous_word(&self, pos: usize) -> Option<&'a str> {
        let mut end = pos;
        while end > 0 && self.sql[end - 1].is_ascii_whitespace() {
            end -= 1;
        }
        let mut start = end;
        while start > 0 && is_ident(self.sql[start - 1]) && self.class[start - 1] == Class::Code {
            start -= 1;
        }
        if start == end {
            return None;
        }
        std::str::from_utf8(&self.sql[start..end]).ok()
    }

    /// One name part: a bare identifier or a backtick identifier
    fn name_part(&self, pos: usize) -> Option<(Span, usize)> {
        match self.sql.get(pos) {
            Some(b'`') => {
                let close = (pos + 1..self.sql.len()).find(|&i| self.sql[i] == b'`')?;
                if close == pos + 1 {
                    return None;
                }
                Some((
                    Span {
                        start: pos + 1,
                        end: close,
                    },
                    close + 1,
                ))
            }
            Some(_) => {
                let (_, end) = self.word(pos)?;
                Some((Span { start: pos, end }, end))
            }
            None => None,
        }
    }

    /// `table`, `db.table`, with either part optionally backticked
    fn table_name(&self, pos: usize) -> Option<(TableRef, usize)> {
        let (first, next) = self.name_part(pos)?;
        if self.sql.get(next) == Some(&b'.') {
            let (second, after) = self.name_part(next + 1)?;
            return Some((
                TableRef {
                    db: Some(first),
                    table: second,
                },
                after,
            ));
        }
        Some((
            TableRef {
                db: None,
                table: first,
            },
            next,
        ))
    }

    fn skip_words(&self, mut pos: usize, words: &[&str]) -> usize {
        loop {
            pos = self.skip_blank(pos);
            match self.word(pos) {
                Some((w, end)) if words.iter().any(|k| k.eq_ignore_ascii_case(w)) => pos = end,
                _ => return pos,
            }
        }
    }

    /// Comma separated table list with optional aliases
    fn table_list(&self, mut pos: usize, multiple: bool, refs: &mut Vec<TableRef>) {
        loop {
            pos = self.skip_blank(pos);
            if self.sql.get(pos) == Some(&b'(') {
                return;
            }
            let (table, next) = match self.table_name(pos) {
                Some(found) => found,
                None => return,
            };
            refs.push(table);
            pos = self.skip_blank(next);
            if !multiple {
                return;
            }

            match self.word(pos) {
                Some((w, end)) if w.eq_ignore_ascii_case("AS") => {
                    pos = self.skip_blank(end);
                    if let Some((_, after)) = self.name_part(pos) {
                        pos = self.skip_blank(after);
                    }
                }
                Some((w, end)) if !CLAUSE_WORDS.iter().any(|k| k.eq_ignore_ascii_case(w)) => {
                    pos = self.skip_blank(end);
                }
                _ => {
                    if self.sql.get(pos) == Some(&b'`') {
                        if let Some((_, after)) = self.name_part(pos) {
                            pos = self.skip_blank(after);
                        }
                    }
                }
            }

            if self.sql.get(pos) != Some(&b',') {
                return;
            }
            pos += 1;
        }
    }
}

/// Find the table references of a statement, in order of appearance
pub fn find_table_refs(sql: &str) -> KumoResult<Vec<TableRef>> {
    let bytes = sql.as_bytes();
    let class = classify(bytes);
    Ok(scan_refs(bytes, &class, finder()?))
}

fn scan_refs(bytes: &[u8], class: &[Class], finder: &AhoCorasick) -> Vec<TableRef> {
    let scanner = Scanner { sql: bytes, class };
    let mut refs = Vec::new();

    for m in finder.find_iter(bytes) {
        let (start, end) = (m.start(), m.end());
        if class[start] != Class::Code
            || (start > 0 && (is_ident(bytes[start - 1]) || bytes[start - 1] == b'.'))
            || bytes.get(end).map_or(false, |b| is_ident(*b))
        {
            continue;
        }

        match m.pattern().as_usize() {
            KW_FROM => scanner.table_list(end, true, &mut refs),
            KW_JOIN | KW_INTO => scanner.table_list(end, false, &mut refs),
            KW_UPDATE => {
                let clause = scanner
                    .previous_word(start)
                    .map_or(false, |w| w.eq_ignore_ascii_case("KEY") || w.eq_ignore_ascii_case("FOR"));
                if !clause {
                    let pos = scanner.skip_words(end, &["LOW_PRIORITY", "IGNORE"]);
                    scanner.table_list(pos, true, &mut refs);
                }
            }
            _ => {
                let pos = scanner.skip_words(end, &["IF", "NOT", "EXISTS"]);
                scanner.table_list(pos, false, &mut refs);
            }
        }
    }

    refs
}

struct Edit {
    start: usize,
    end: usize,
    text: String,
}

fn splice(sql: &str, mut edits: Vec<Edit>) -> String {
    if edits.is_empty() {
        return sql.to_string();
    }
    edits.sort_by_key(|e| e.start);

    let extra: usize = edits.iter().map(|e| e.text.len()).sum();
    let mut out = String::with_capacity(sql.len() + extra);
    let mut last = 0;
    for edit in edits {
        if edit.start < last {
            continue;
        }
        out.push_str(&sql[last..edit.start]);
        out.push_str(&edit.text);
        last = edit.end;
    }
    out.push_str(&sql[last..]);
    out
}

/// Rewrite the split tables of a statement.
///
/// `resolve(db, table)` returns the sub-table index of a reference, or
/// `None` to leave it alone. References are parsed from the statement and
/// renamed along with their `table.column` qualifiers. With `explicit`
/// set, only references to the listed tables are considered; a `db.table`
/// entry matches that database only.
pub fn rewrite_sql<F>(sql: &str, explicit: Option<&[&str]>, mut resolve: F) -> KumoResult<String>
where
    F: FnMut(Option<&str>, &str) -> KumoResult<Option<u32>>,
{
    let bytes = sql.as_bytes();
    let class = classify(bytes);
    let wanted: Option<Vec<(Option<&str>, &str)>> = explicit.map(|tables| {
        tables
            .iter()
            .map(|name| match name.split_once('.') {
                Some((db, table)) => (Some(db.trim()), table.trim()),
                None => (None, name.trim()),
            })
            .filter(|(_, table)| !table.is_empty())
            .collect()
    });

    let refs = scan_refs(bytes, &class, finder()?);
    let mut edits = Vec::new();
    let mut renamed: FnvHashMap<&str, String> = FnvHashMap::default();
    let mut taken: FnvHashSet<usize> = FnvHashSet::default();

    for table_ref in &refs {
        if let Some(db) = table_ref.db {
            taken.insert(db.start);
        }
        let table = table_ref.table_name(sql);
        let db = table_ref.db_name(sql);
        if let Some(wanted) = &wanted {
            let listed = wanted.iter().any(|(want_db, want_table)| {
                *want_table == table && want_db.map_or(true, |want_db| Some(want_db) == db)
            });
            if !listed {
                continue;
            }
        }
        if let Some(id) = resolve(db, table)? {
            let text = format!("{}_{}", table, id);
            taken.insert(table_ref.table.start);
            edits.push(Edit {
                start: table_ref.table.start,
                end: table_ref.table.end,
                text: text.clone(),
            });
            renamed.insert(table, text);
        }
    }

    // `table.column` qualifiers follow their table
    for (table, text) in &renamed {
        for (start, _) in sql.match_indices(*table) {
            let end = start + table.len();
            if class[start] == Class::Code
                && !taken.contains(&start)
                && (start == 0 || (!is_ident(bytes[start - 1]) && bytes[start - 1] != b'.'))
                && bytes.get(end) == Some(&b'.')
            {
                edits.push(Edit {
                    start,
                    end,
                    text: text.clone(),
                });
            }
        }
    }

    Ok(splice(sql, edits))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_to_2(_db: Option<&str>, table: &str) -> KumoResult<Option<u32>> {
        Ok(if table == "orders" { Some(2) } else { None })
    }

    fn rewrite(sql: &str) -> String {
        rewrite_sql(sql, None, orders_to_2).unwrap()
    }

    #[test]
    fn test_simple_select() {
        assert_eq!(
            rewrite("SELECT * FROM orders WHERE id=1"),
            "SELECT * FROM orders_2 WHERE id=1"
        );
        assert_eq!(
            rewrite("select * from `orders` where id=1"),
            "select * from `orders_2` where id=1"
        );
    }

    #[test]
    fn test_unsplit_statement_is_byte_identical() {
        let sql = "SELECT from_date, 'from orders' FROM users -- join orders\n WHERE x = \"into orders\"";
        assert_eq!(rewrite(sql), sql);
        let sql = "SELECT * FROM orders_archive WHERE name LIKE '%orders%'";
        assert_eq!(rewrite(sql), sql);
    }

    #[test]
    fn test_literals_are_not_rewritten() {
        assert_eq!(
            rewrite("SELECT * FROM orders WHERE note = 'join orders now' /* FROM orders */"),
            "SELECT * FROM orders_2 WHERE note = 'join orders now' /* FROM orders */"
        );
        assert_eq!(
            rewrite("SELECT * FROM users WHERE a = 'it''s from orders'"),
            "SELECT * FROM users WHERE a = 'it''s from orders'"
        );
    }

    #[test]
    fn test_dml_statements() {
        assert_eq!(
            rewrite("INSERT INTO orders(id, uid) VALUES (1, 2)"),
            "INSERT INTO orders_2(id, uid) VALUES (1, 2)"
        );
        assert_eq!(
            rewrite("UPDATE LOW_PRIORITY orders SET state = 1"),
            "UPDATE LOW_PRIORITY orders_2 SET state = 1"
        );
        assert_eq!(
            rewrite("DELETE FROM orders WHERE id = 3"),
            "DELETE FROM orders_2 WHERE id = 3"
        );
        assert_eq!(
            rewrite("CREATE TABLE IF NOT EXISTS orders (id INT)"),
            "CREATE TABLE IF NOT EXISTS orders_2 (id INT)"
        );
        let upsert = "INSERT INTO users (a) VALUES (1) ON DUPLICATE KEY UPDATE orders = 1";
        assert_eq!(rewrite(upsert), upsert);
        let locking = "SELECT * FROM users WHERE id = 1 FOR UPDATE";
        assert_eq!(rewrite(locking), locking);
    }

    #[test]
    fn test_joins_aliases_and_qualifiers() {
        assert_eq!(
            rewrite("SELECT orders.id, u.name FROM orders JOIN users u ON orders.uid = u.id"),
            "SELECT orders_2.id, u.name FROM orders_2 JOIN users u ON orders_2.uid = u.id"
        );
        assert_eq!(
            rewrite("SELECT * FROM users u, orders AS o WHERE o.uid = u.id"),
            "SELECT * FROM users u, orders_2 AS o WHERE o.uid = u.id"
        );
        assert_eq!(
            rewrite("SELECT * FROM users LEFT JOIN orders ON users.id = orders.uid"),
            "SELECT * FROM users LEFT JOIN orders_2 ON users.id = orders_2.uid"
        );
    }

    #[test]
    fn test_subquery() {
        assert_eq!(
            rewrite("SELECT * FROM (SELECT * FROM orders) t WHERE t.id IN (SELECT oid FROM orders)"),
            "SELECT * FROM (SELECT * FROM orders_2) t WHERE t.id IN (SELECT oid FROM orders_2)"
        );
    }

    #[test]
    fn test_db_prefix_is_passed_to_resolver() {
        let mut seen = Vec::new();
        let out = rewrite_sql("SELECT * FROM shop.orders", None, |db, table| {
            seen.push((db.map(str::to_string), table.to_string()));
            Ok(Some(5))
        })
        .unwrap();
        assert_eq!(out, "SELECT * FROM shop.orders_5");
        assert_eq!(seen, vec![(Some("shop".to_string()), "orders".to_string())]);
    }

    #[test]
    fn test_explicit_tables() {
        let sql = "SELECT * FROM orders o WHERE o.id IN (SELECT oid FROM `orders`) AND x = 'orders'";
        let out = rewrite_sql(sql, Some(&["orders", "users"]), orders_to_2).unwrap();
        assert_eq!(
            out,
            "SELECT * FROM orders_2 o WHERE o.id IN (SELECT oid FROM `orders_2`) AND x = 'orders'"
        );
    }

    #[test]
    fn test_explicit_tables_leave_columns_alone() {
        let sql = "SELECT t.orders, orders FROM orders t WHERE t.orders > 0";
        assert_eq!(
            rewrite_sql(sql, Some(&["orders"]), orders_to_2).unwrap(),
            "SELECT t.orders, orders FROM orders_2 t WHERE t.orders > 0"
        );
        assert_eq!(rewrite(sql), rewrite_sql(sql, Some(&["orders"]), orders_to_2).unwrap());

        let sql = "SELECT orders.id FROM orders JOIN users ON orders.uid = users.id";
        assert_eq!(
            rewrite_sql(sql, Some(&["orders"]), |_, _| Ok(Some(4))).unwrap(),
            "SELECT orders_4.id FROM orders_4 JOIN users ON orders_4.uid = users.id"
        );
    }

    #[test]
    fn test_explicit_db_table_matches_its_database_only() {
        let sql = "SELECT * FROM shop.orders a JOIN archive.orders b ON a.id = b.id";
        let mut seen = Vec::new();
        let out = rewrite_sql(sql, Some(&["shop.orders"]), |db, table| {
            seen.push((db.map(str::to_string), table.to_string()));
            Ok(Some(1))
        })
        .unwrap();
        assert_eq!(
            out,
            "SELECT * FROM shop.orders_1 a JOIN archive.orders b ON a.id = b.id"
        );
        assert_eq!(seen, vec![(Some("shop".to_string()), "orders".to_string())]);

        // A bare entry matches the table in any database.
        let out = rewrite_sql(sql, Some(&["orders"]), |_, _| Ok(Some(3))).unwrap();
        assert_eq!(
            out,
            "SELECT * FROM shop.orders_3 a JOIN archive.orders_3 b ON a.id = b.id"
        );
        let out = rewrite_sql("SELECT * FROM orders", Some(&["shop.orders"]), |_, _| Ok(Some(3)))
            .unwrap();
        assert_eq!(out, "SELECT * FROM orders");
    }

    #[test]
    fn test_resolver_errors_propagate() {
        let err = rewrite_sql("SELECT * FROM orders", None, |_, table| {
            Err(KumoError::NoPartitionKey {
                table: table.to_string(),
            })
        })
        .unwrap_err();
        assert!(matches!(err, KumoError::NoPartitionKey { .. }));
    }

    #[test]
    fn test_find_table_refs() {
        let sql = "SELECT * FROM a, `b` JOIN db.c ON a.x = c.x";
        let refs = find_table_refs(sql).unwrap();
        let names: Vec<(Option<&str>, &str)> = refs
            .iter()
            .map(|r| (r.db_name(sql), r.table_name(sql)))
            .collect();
        assert_eq!(names, vec![(None, "a"), (None, "b"), (Some("db"), "c")]);
    }
}
