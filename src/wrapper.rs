//! Stable surrogate keys for the column flagged `autoIncremental`.
//!
//! Two shapes of input are handled. In explicit mode the query already projects
//! the column (usually a `ROW_NUMBER()`), and the expression is offset by the
//! destination's current max. In implicit mode the column is built here on top
//! of the query through `source_data` / `existing_data` / `max_id` CTEs.
//! Rows whose unique key already exists are excluded before any id is
//! numbered, so ids are never reused after a delete.

use crate::adapter::{Adapter, Capabilities};
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::project::{ModelMetadata, Strategy};
use crate::sql::{ProjectedColumn, SqlRewriter};
use crate::{quote_ident, quote_qualified};
use std::collections::HashSet;

pub struct AutoIncrementalWrapper<'a> {
    adapter: &'a dyn Adapter,
    capabilities: Capabilities,
    rewriter: SqlRewriter,
    logger: Logger,
}

/// Source column feeding a destination column in implicit mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
}

impl<'a> AutoIncrementalWrapper<'a> {
    pub fn new(adapter: &'a dyn Adapter, logger: Logger) -> Self {
        AutoIncrementalWrapper {
            adapter,
            capabilities: adapter.capabilities(),
            rewriter: SqlRewriter::new(logger.clone()),
            logger: logger.with_category("wrapper"),
        }
    }

    pub fn should_wrap(&self, metadata: &ModelMetadata) -> bool {
        metadata.schema.iter().any(|c| c.auto_incremental)
    }

    /// Relation name ready to splice into SQL, degrading to plain quoting.
    pub fn qualify(&self, name: &str) -> String {
        if !self.capabilities.qualify_object_name {
            return quote_qualified(name);
        }
        match self.adapter.qualify_object_name(name) {
            Ok(qualified) => qualified,
            Err(e) => {
                self.logger
                    .debug(&format!("could not qualify {name} ({e}), using it as written"));
                quote_qualified(name)
            }
        }
    }

    /// Rewrite `sql` for the model `target` so its auto-incremental column
    /// yields stable ids. `time_filter` is ANDed into the source query.
    pub fn wrap(
        &self,
        target: &str,
        sql: &str,
        metadata: &ModelMetadata,
        time_filter: Option<&str>,
    ) -> Result<String> {
        let logger = self.logger.scoped(target);
        let Some(column) = metadata.auto_incremental_column(target)? else {
            return self.filtered(sql, time_filter);
        };
        let column = column.name.as_str();

        let (strategy, unique_key) = match &metadata.incremental {
            Some(cfg) => (cfg.strategy(), cfg.unique_key().to_vec()),
            None => (Strategy::Append, Vec::new()),
        };
        let dest_exists = self.adapter.table_exists(target)?;
        let qualified = self.qualify(target);
        let keyed = strategy != Strategy::Append && !unique_key.is_empty();
        let exclude_existing = dest_exists && keyed;

        let wrapped = match self.rewriter.find_projection(sql, column)? {
            Some(projection) if keyed => {
                logger.debug(&format!(
                    "explicit auto-increment on {column}, renumbering after key exclusion"
                ));
                self.explicit_with_exclusion(
                    target,
                    sql,
                    column,
                    &projection,
                    &unique_key,
                    dest_exists.then_some(qualified.as_str()),
                    time_filter,
                )?
            }
            Some(projection) => {
                logger.debug(&format!("explicit auto-increment on {column}, offsetting by current max"));
                let current_max = if dest_exists {
                    format!(
                        "(SELECT COALESCE(MAX({}), 0) FROM {qualified})",
                        quote_ident(column)
                    )
                } else {
                    "0".to_string()
                };
                let offset = self.rewriter.replace_projection(
                    sql,
                    column,
                    &format!("({current_max} + {})", projection.expr),
                )?;
                self.filtered(&offset, time_filter)?
            }
            None => {
                logger.debug(&format!("implicit auto-increment on {column}"));
                self.implicit(
                    target,
                    sql,
                    column,
                    metadata,
                    &unique_key,
                    dest_exists,
                    exclude_existing,
                    &qualified,
                    time_filter,
                )?
            }
        };
        logger.debug(&format!("wrapped SQL: {wrapped}"));
        Ok(wrapped)
    }

    fn filtered(&self, sql: &str, time_filter: Option<&str>) -> Result<String> {
        match time_filter {
            Some(condition) => self.rewriter.inject_where(sql, condition),
            None => Ok(sql.to_string()),
        }
    }

    /// Output column names of `sql`, expanding wildcards through the adapter.
    fn output_columns(&self, model: &str, sql: &str) -> Result<Vec<String>> {
        let projected = self.rewriter.projected_columns(sql)?;
        if projected.iter().any(|c| c.is_wildcard) {
            if !self.capabilities.describe_query_schema {
                return Err(Error::config(
                    model,
                    "wildcard projection cannot be expanded: adapter cannot describe queries",
                ));
            }
            return Ok(self
                .adapter
                .describe_query_schema(sql)?
                .into_iter()
                .map(|c| c.name)
                .collect());
        }
        projected
            .into_iter()
            .map(|c| {
                c.name.ok_or_else(|| {
                    Error::config(model, format!("projected expression `{}` needs an alias", c.expr))
                })
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn explicit_with_exclusion(
        &self,
        model: &str,
        sql: &str,
        column: &str,
        projection: &ProjectedColumn,
        unique_key: &[String],
        existing: Option<&str>,
        time_filter: Option<&str>,
    ) -> Result<String> {
        let source = self.filtered(sql, time_filter)?;
        let others: Vec<String> = self
            .output_columns(model, sql)?
            .into_iter()
            .filter(|c| !c.eq_ignore_ascii_case(column))
            .collect();
        check_key_columns(model, unique_key, &others)?;
        self.logger.scoped(model).debug(&format!(
            "dropping source expression {} in favour of key-ordered numbering",
            projection.expr
        ));

        let select_list: Vec<String> = others
            .iter()
            .map(|c| format!("s.{}", quote_ident(c)))
            .collect();
        let keys: Vec<(String, String)> = unique_key.iter().map(|k| (k.clone(), k.clone())).collect();
        Ok(numbered_select(
            &source,
            column,
            unique_key,
            &select_list,
            &keys,
            existing,
            false,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn implicit(
        &self,
        model: &str,
        sql: &str,
        column: &str,
        metadata: &ModelMetadata,
        unique_key: &[String],
        dest_exists: bool,
        exclude_existing: bool,
        qualified: &str,
        time_filter: Option<&str>,
    ) -> Result<String> {
        let source = self.filtered(sql, time_filter)?;
        let source_columns = self.output_columns(model, sql)?;

        let declared: Vec<String> = if dest_exists {
            self.adapter
                .get_table_info(model)?
                .schema
                .into_iter()
                .map(|c| c.name)
                .collect()
        } else {
            metadata.schema.iter().map(|c| c.name.clone()).collect()
        };
        let declared: Vec<String> = declared
            .into_iter()
            .filter(|c| !c.eq_ignore_ascii_case(column))
            .collect();

        let mapping = if declared.is_empty() {
            source_columns
                .iter()
                .map(|c| ColumnMapping {
                    source: c.clone(),
                    target: c.clone(),
                })
                .collect()
        } else {
            map_columns(model, &source_columns, &declared)?
        };

        let order_columns: Vec<String> = if unique_key.is_empty() {
            mapping.iter().map(|m| m.target.clone()).collect()
        } else {
            let targets: Vec<String> = mapping.iter().map(|m| m.target.clone()).collect();
            check_key_columns(model, unique_key, &targets)?;
            unique_key.to_vec()
        };

        let select_list: Vec<String> = mapping
            .iter()
            .map(|m| format!("s.{} AS {}", quote_ident(&m.source), quote_ident(&m.target)))
            .collect();
        let keys: Vec<(String, String)> = unique_key
            .iter()
            .map(|k| {
                let source = mapping
                    .iter()
                    .find(|m| m.target.eq_ignore_ascii_case(k))
                    .map(|m| m.source.clone())
                    .unwrap_or_else(|| k.clone());
                (source, k.clone())
            })
            .collect();

        Ok(numbered_select(
            &source,
            column,
            &order_columns,
            &select_list,
            &keys,
            if dest_exists { Some(qualified) } else { None },
            !exclude_existing,
        ))
    }
}

fn check_key_columns(model: &str, unique_key: &[String], columns: &[String]) -> Result<()> {
    let available: HashSet<String> = columns.iter().map(|c| c.to_lowercase()).collect();
    let missing: Vec<&str> = unique_key
        .iter()
        .filter(|k| !available.contains(&k.to_lowercase()))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::config(
            model,
            format!("unique_key column(s) not projected by the query: {}", missing.join(", ")),
        ))
    }
}

/// Pair source columns with destination columns.
///
/// Exact case-insensitive names first. When columns are left over on both
/// sides, exactly one on each side is mapped positionally; anything else is
/// ambiguous and rejected. Source columns with no destination counterpart
/// pass through under their own name.
pub fn map_columns(model: &str, source: &[String], target: &[String]) -> Result<Vec<ColumnMapping>> {
    let target_lower: HashSet<String> = target.iter().map(|c| c.to_lowercase()).collect();
    let source_lower: HashSet<String> = source.iter().map(|c| c.to_lowercase()).collect();

    let unmatched_source: Vec<&String> = source
        .iter()
        .filter(|c| !target_lower.contains(&c.to_lowercase()))
        .collect();
    let unmatched_target: Vec<&String> = target
        .iter()
        .filter(|c| !source_lower.contains(&c.to_lowercase()))
        .collect();

    let positional = match (unmatched_source.as_slice(), unmatched_target.as_slice()) {
        (_, []) | ([], _) => None,
        ([src], [dst]) => Some(((*src).clone(), (*dst).clone())),
        (src, dst) => {
            return Err(Error::config(
                model,
                format!(
                    "cannot map query columns [{}] onto table columns [{}]",
                    src.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
                    dst.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                ),
            ))
        }
    };

    Ok(source
        .iter()
        .map(|s| {
            let target = match target.iter().find(|t| t.eq_ignore_ascii_case(s)) {
                Some(t) => t.clone(),
                None => match &positional {
                    Some((src, dst)) if src == s => dst.clone(),
                    _ => s.clone(),
                },
            };
            ColumnMapping {
                source: s.clone(),
                target,
            }
        })
        .collect())
}

/// `source_data` / `existing_data` / `max_id` CTEs plus the numbering select.
///
/// `existing` is the qualified destination, if it exists. Exclusion joins
/// `(source, destination)` key pairs and is skipped when `keep_existing` is set.
fn numbered_select(
    source: &str,
    column: &str,
    order_columns: &[String],
    select_list: &[String],
    keys: &[(String, String)],
    existing: Option<&str>,
    keep_existing: bool,
) -> String {
    let exclude = existing.is_some() && !keep_existing && !keys.is_empty();

    let mut ctes = vec![format!("source_data AS (\n{source}\n)")];
    if let (true, Some(dest)) = (exclude, existing) {
        let targets: Vec<String> = keys.iter().map(|(_, t)| quote_ident(t)).collect();
        ctes.push(format!(
            "existing_data AS (SELECT DISTINCT {} FROM {dest})",
            targets.join(", ")
        ));
    }
    ctes.push(match existing {
        Some(dest) => format!(
            "max_id AS (SELECT COALESCE(MAX({}), 0) AS max_id FROM {dest})",
            quote_ident(column)
        ),
        None => "max_id AS (SELECT 0 AS max_id)".to_string(),
    });

    let mut inner = format!("SELECT DISTINCT {} FROM source_data AS s", select_list.join(", "));
    if exclude {
        let on: Vec<String> = keys
            .iter()
            .map(|(s, t)| format!("s.{} = e.{}", quote_ident(s), quote_ident(t)))
            .collect();
        inner.push_str(&format!(
            " LEFT JOIN existing_data AS e ON {} WHERE e.{} IS NULL",
            on.join(" AND "),
            quote_ident(&keys[0].1)
        ));
    }

    let order: Vec<String> = order_columns
        .iter()
        .map(|c| format!("d.{}", quote_ident(c)))
        .collect();
    let order_by = if order.is_empty() {
        String::new()
    } else {
        format!("ORDER BY {}", order.join(", "))
    };

    format!(
        "WITH {}\nSELECT CAST(max_id.max_id + ROW_NUMBER() OVER ({order_by}) AS BIGINT) AS {}, d.*\n\
         FROM ({inner}) AS d\nCROSS JOIN max_id",
        ctes.join(",\n"),
        quote_ident(column)
    )
}
