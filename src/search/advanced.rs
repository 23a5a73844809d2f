//! 搜索词中的高级筛选指令
//!
//! 指令表在启动时构建一次，解析过程无共享状态，同一请求内
//! 捕获的子句只作用于该请求。未识别的词保留为剩余搜索词。

use std::sync::LazyLock;

use anyhow::Result;
use chrono::{Days, NaiveDate, Utc};
use regex::{Captures, Regex};
use sqlx::{Postgres, QueryBuilder};

use crate::db::Database;

/// 解析出的筛选子句，尚未接触数据库
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterClause {
    Topic(i64),
    CreatedBefore(NaiveDate),
    CreatedAfter(NaiveDate),
    /// 用户名已归一化为小写
    Author(String),
    Tags(Vec<String>),
    Category { slug: String, subslug: Option<String>, exact: bool },
}

/// 指令匹配结果：解析失败的指令按无操作处理，但仍然消耗该词
enum DirectiveOutcome {
    Clause(FilterClause),
    Noop,
}

type Handler = fn(&Captures) -> DirectiveOutcome;

/// 按注册顺序匹配的指令表
pub struct DirectiveTable {
    entries: Vec<(Regex, Handler)>,
}

impl DirectiveTable {
    /// 内置指令集
    pub fn builtin() -> Self {
        let entries: Vec<(&str, Handler)> = vec![
            (r"(?i)\Atopic:(\d+)\z", handle_topic),
            (r"(?i)\Abefore:(.*)\z", handle_before),
            (r"(?i)\Aafter:(.*)\z", handle_after),
            (r"(?i)\A@(\S+)\z", handle_author),
            (r"(?i)\Atags:(\S+)\z", handle_tags),
            (r"(?i)\A#([\p{L}\p{M}0-9\-:=]+)\z", handle_category),
        ];
        Self {
            entries: entries
                .into_iter()
                .map(|(pattern, handler)| (Regex::new(pattern).unwrap(), handler))
                .collect(),
        }
    }
}

fn handle_topic(caps: &Captures) -> DirectiveOutcome {
    match caps[1].parse() {
        Ok(id) => DirectiveOutcome::Clause(FilterClause::Topic(id)),
        Err(_) => DirectiveOutcome::Noop,
    }
}

fn handle_before(caps: &Captures) -> DirectiveOutcome {
    match word_to_date(&caps[1], Utc::now().date_naive()) {
        Some(date) => DirectiveOutcome::Clause(FilterClause::CreatedBefore(date)),
        None => DirectiveOutcome::Noop,
    }
}

fn handle_after(caps: &Captures) -> DirectiveOutcome {
    match word_to_date(&caps[1], Utc::now().date_naive()) {
        Some(date) => DirectiveOutcome::Clause(FilterClause::CreatedAfter(date)),
        None => DirectiveOutcome::Noop,
    }
}

fn handle_author(caps: &Captures) -> DirectiveOutcome {
    DirectiveOutcome::Clause(FilterClause::Author(caps[1].to_lowercase()))
}

fn handle_tags(caps: &Captures) -> DirectiveOutcome {
    let names: Vec<String> =
        caps[1].split(',').filter(|s| !s.is_empty()).map(str::to_string).collect();
    if names.is_empty() {
        return DirectiveOutcome::Noop;
    }
    DirectiveOutcome::Clause(FilterClause::Tags(names))
}

fn handle_category(caps: &Captures) -> DirectiveOutcome {
    let mut raw = &caps[1];
    let exact = raw.starts_with('=');
    if exact {
        raw = &raw[1..];
    }
    let mut parts = raw.splitn(2, ':');
    let Some(slug) = parts.next().filter(|s| !s.is_empty()) else {
        return DirectiveOutcome::Noop;
    };
    let subslug = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    DirectiveOutcome::Clause(FilterClause::Category { slug: slug.to_string(), subslug, exact })
}

/// 解析日期表达式：绝对日期、年月、年份，或 N 天前
pub fn word_to_date(word: &str, today: NaiveDate) -> Option<NaiveDate> {
    let word = word.trim();
    if let Ok(date) = NaiveDate::parse_from_str(word, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{word}-01"), "%Y-%m-%d") {
        return Some(date);
    }
    if word.chars().all(|c| c.is_ascii_digit()) && !word.is_empty() {
        if word.len() == 4 {
            return NaiveDate::from_ymd_opt(word.parse().ok()?, 1, 1);
        }
        let days: u64 = word.parse().ok()?;
        return today.checked_sub_days(Days::new(days));
    }
    None
}

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""[^"]+"|\S+"#).unwrap());

/// 解析结果：剩余搜索词与捕获的子句
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub residual: String,
    pub clauses: Vec<FilterClause>,
}

/// 按空白切词并保留双引号短语，识别出的指令从剩余词中剔除
///
/// 同一个词可以命中多条指令，全部记入子句
pub fn parse(table: &DirectiveTable, term: &str) -> ParsedQuery {
    let mut residual = Vec::new();
    let mut clauses = Vec::new();
    for token in TOKEN_RE.find_iter(term).map(|m| m.as_str()) {
        let cleaned: String = token.chars().filter(|c| *c != '"' && *c != '\'').collect();
        let mut matched = false;
        for (pattern, handler) in &table.entries {
            if let Some(caps) = pattern.captures(&cleaned) {
                matched = true;
                if let DirectiveOutcome::Clause(clause) = handler(&caps) {
                    clauses.push(clause);
                }
            }
        }
        if !matched {
            residual.push(token);
        }
    }
    ParsedQuery { residual: residual.join(" "), clauses }
}

/// 落到数据库后的子句，可直接拼入查询条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedClause {
    TopicId(i64),
    CreatedBefore(NaiveDate),
    CreatedAfter(NaiveDate),
    /// None 表示用户不存在，条件恒为假
    AuthorId(Option<i64>),
    TagNames(Vec<String>),
    /// None 表示分类不存在，条件恒为假
    CategoryIds(Option<Vec<i64>>),
}

/// 解析用户名与分类 slug，`@me` 落到当前请求者
pub async fn resolve_clauses(
    pool: &Database,
    clauses: &[FilterClause],
    current_user: Option<i64>,
) -> Result<Vec<ResolvedClause>> {
    let mut resolved = Vec::with_capacity(clauses.len());
    for clause in clauses {
        let item = match clause {
            FilterClause::Topic(id) => ResolvedClause::TopicId(*id),
            FilterClause::CreatedBefore(date) => ResolvedClause::CreatedBefore(*date),
            FilterClause::CreatedAfter(date) => ResolvedClause::CreatedAfter(*date),
            FilterClause::Author(username) => {
                let id: Option<i64> = sqlx::query_scalar(
                    "SELECT id FROM users WHERE username_lower = $1 AND NOT staged",
                )
                .bind(username)
                .fetch_optional(pool)
                .await?;
                let id = id.or(if username == "me" { current_user } else { None });
                ResolvedClause::AuthorId(id)
            }
            FilterClause::Tags(names) => ResolvedClause::TagNames(names.clone()),
            FilterClause::Category { slug, subslug, exact } => {
                ResolvedClause::CategoryIds(
                    resolve_category_ids(pool, slug, subslug.as_deref(), *exact).await?,
                )
            }
        };
        resolved.push(item);
    }
    Ok(resolved)
}

/// slug 大小写不敏感地解析为分类 ID，非精确匹配时附带全部子孙分类
async fn resolve_category_ids(
    pool: &Database,
    slug: &str,
    subslug: Option<&str>,
    exact: bool,
) -> Result<Option<Vec<i64>>> {
    let category_id: Option<i64> = if let Some(subslug) = subslug {
        sqlx::query_scalar(
            r#"
            SELECT c.id FROM categories c
            JOIN categories p ON c.parent_category_id = p.id
            WHERE lower(c.slug) = lower($2) AND lower(p.slug) = lower($1)
            "#,
        )
        .bind(slug)
        .bind(subslug)
        .fetch_optional(pool)
        .await?
    } else {
        // 根分类与子分类同名时优先取根分类
        sqlx::query_scalar(
            r#"
            SELECT id FROM categories WHERE lower(slug) = lower($1)
            ORDER BY (parent_category_id IS NULL) DESC LIMIT 1
            "#,
        )
        .bind(slug)
        .fetch_optional(pool)
        .await?
    };
    let Some(category_id) = category_id else {
        return Ok(None);
    };

    let mut ids = vec![category_id];
    if !exact {
        let mut frontier = vec![category_id];
        while !frontier.is_empty() {
            let children: Vec<i64> =
                sqlx::query_scalar("SELECT id FROM categories WHERE parent_category_id = ANY($1)")
                    .bind(frontier.clone())
                    .fetch_all(pool)
                    .await?;
            frontier = children.into_iter().filter(|id| !ids.contains(id)).collect();
            ids.extend_from_slice(&frontier);
        }
    }
    Ok(Some(ids))
}

/// 把已解析的子句追加为查询条件，子句之间为 AND 关系
pub fn push_clause_conditions(qb: &mut QueryBuilder<'_, Postgres>, clauses: &[ResolvedClause]) {
    for clause in clauses {
        match clause {
            ResolvedClause::TopicId(id) => {
                qb.push(" AND posts.topic_id = ").push_bind(*id);
            }
            ResolvedClause::CreatedBefore(date) => {
                qb.push(" AND posts.created_at < ").push_bind(*date);
            }
            ResolvedClause::CreatedAfter(date) => {
                qb.push(" AND posts.created_at > ").push_bind(*date);
            }
            ResolvedClause::AuthorId(Some(id)) => {
                qb.push(" AND posts.user_id = ").push_bind(*id);
            }
            ResolvedClause::AuthorId(None) | ResolvedClause::CategoryIds(None) => {
                qb.push(" AND FALSE");
            }
            ResolvedClause::TagNames(names) => {
                qb.push(
                    " AND EXISTS (SELECT 1 FROM topic_tags tt JOIN tags t ON tt.tag_id = t.id WHERE tt.topic_id = topics.id AND t.name = ANY(",
                )
                .push_bind(names.clone())
                .push("))");
            }
            ResolvedClause::CategoryIds(Some(ids)) => {
                qb.push(" AND topics.category_id = ANY(").push_bind(ids.clone()).push(")");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn table() -> DirectiveTable {
        DirectiveTable::builtin()
    }

    #[test]
    fn topic_directive_round_trip() {
        let parsed = parse(&table(), "cat topic:42 dog");
        assert_eq!(parsed.residual, "cat dog");
        assert_eq!(parsed.clauses, vec![FilterClause::Topic(42)]);
    }

    #[test]
    fn quoted_phrase_is_one_token() {
        let parsed = parse(&table(), r#""red car" topic:7"#);
        assert_eq!(parsed.residual, r#""red car""#);
        assert_eq!(parsed.clauses, vec![FilterClause::Topic(7)]);
    }

    #[test]
    fn author_directive_normalizes_case() {
        let parsed = parse(&table(), "@Alice hello");
        assert_eq!(parsed.residual, "hello");
        assert_eq!(parsed.clauses, vec![FilterClause::Author("alice".to_string())]);
    }

    #[test]
    fn unparseable_date_consumes_token_without_clause() {
        let parsed = parse(&table(), "before:someday cat");
        assert_eq!(parsed.residual, "cat");
        assert!(parsed.clauses.is_empty());
    }

    #[test]
    fn absolute_date_directive() {
        let parsed = parse(&table(), "after:2024-05-01");
        assert_eq!(
            parsed.clauses,
            vec![FilterClause::CreatedAfter(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())]
        );
    }

    #[test]
    fn tags_directive_splits_names() {
        let parsed = parse(&table(), "tags:cats,dogs fluffy");
        assert_eq!(parsed.residual, "fluffy");
        assert_eq!(
            parsed.clauses,
            vec![FilterClause::Tags(vec!["cats".to_string(), "dogs".to_string()])]
        );
    }

    #[rstest]
    #[case("#pets", "pets", None, false)]
    #[case("#=pets", "pets", None, true)]
    #[case("#pets:cats", "pets", Some("cats"), false)]
    fn category_directive_forms(
        #[case] input: &str,
        #[case] slug: &str,
        #[case] subslug: Option<&str>,
        #[case] exact: bool,
    ) {
        let parsed = parse(&table(), input);
        assert_eq!(
            parsed.clauses,
            vec![FilterClause::Category {
                slug: slug.to_string(),
                subslug: subslug.map(str::to_string),
                exact,
            }]
        );
    }

    #[test]
    fn unmatched_tokens_survive_verbatim() {
        let parsed = parse(&table(), "topic:x cat");
        // topic:x 不符合数字格式，不算指令
        assert_eq!(parsed.residual, "topic:x cat");
        assert!(parsed.clauses.is_empty());
    }

    #[rstest]
    #[case("2024-05-01", Some((2024, 5, 1)))]
    #[case("2024-05", Some((2024, 5, 1)))]
    #[case("2024", Some((2024, 1, 1)))]
    #[case("7", Some((2025, 2, 22)))]
    #[case("someday", None)]
    fn word_to_date_forms(#[case] word: &str, #[case] expected: Option<(i32, u32, u32)>) {
        let today = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let expected = expected.map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap());
        assert_eq!(word_to_date(word, today), expected);
    }

    #[test]
    fn clause_conditions_compose_with_and() {
        let mut qb = QueryBuilder::new("SELECT 1 FROM posts WHERE TRUE");
        push_clause_conditions(
            &mut qb,
            &[ResolvedClause::TopicId(42), ResolvedClause::AuthorId(None)],
        );
        let sql = qb.sql();
        assert!(sql.contains("posts.topic_id = "));
        assert!(sql.contains(" AND FALSE"));
    }
}
