use super::{ProjectedColumn, QueryRewriter};
use crate::error::{Error, Result};
use sqlparser::ast::{
    BinaryOperator, Expr, Ident, ObjectName, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, TableWithJoins, With,
};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;

/// Structural rewriting over the `sqlparser` AST.
pub struct AstRewriter;

fn parse_query(sql: &str) -> Result<Box<Query>> {
    let dialect = DuckDbDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql)?;
    if statements.len() != 1 {
        return Err(Error::rewrite(format!(
            "expected a single statement, found {}",
            statements.len()
        )));
    }
    match statements.remove(0) {
        Statement::Query(query) => Ok(query),
        other => Err(Error::rewrite(format!("not a query: {other}"))),
    }
}

fn parse_expr(text: &str) -> Result<Expr> {
    let dialect = DuckDbDialect {};
    Ok(Parser::new(&dialect).try_with_sql(text)?.parse_expr()?)
}

fn select_mut(query: &mut Query) -> Result<&mut Select> {
    match query.body.as_mut() {
        SetExpr::Select(select) => Ok(select),
        _ => Err(Error::rewrite("query body is not a plain SELECT")),
    }
}

fn object_name(name: &ObjectName) -> Option<String> {
    let parts: Option<Vec<&str>> = name
        .0
        .iter()
        .map(|p| p.as_ident().map(|i| i.value.as_str()))
        .collect();
    parts.map(|p| p.join("."))
}

fn implicit_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.clone()),
        _ => None,
    }
}

impl AstRewriter {
    pub fn table_references(&self, sql: &str) -> Result<Vec<String>> {
        let dialect = DuckDbDialect {};
        let statements = Parser::parse_sql(&dialect, sql)?;
        let mut refs = Vec::new();
        for stmt in &statements {
            if let Statement::Query(query) = stmt {
                extract_from_query(query, &mut refs, &HashSet::new());
            }
        }
        Ok(refs)
    }
}

impl QueryRewriter for AstRewriter {
    fn projected_columns(&self, sql: &str) -> Result<Vec<ProjectedColumn>> {
        let mut query = parse_query(sql)?;
        let select = select_mut(&mut query)?;
        Ok(select
            .projection
            .iter()
            .map(|item| match item {
                SelectItem::ExprWithAlias { expr, alias } => ProjectedColumn {
                    name: Some(alias.value.clone()),
                    expr: expr.to_string(),
                    is_wildcard: false,
                },
                SelectItem::UnnamedExpr(expr) => ProjectedColumn {
                    name: implicit_name(expr),
                    expr: expr.to_string(),
                    is_wildcard: false,
                },
                other => ProjectedColumn {
                    name: None,
                    expr: other.to_string(),
                    is_wildcard: true,
                },
            })
            .collect())
    }

    fn replace_projection(&self, sql: &str, alias: &str, replacement: &str) -> Result<String> {
        let mut query = parse_query(sql)?;
        let new_expr = parse_expr(replacement)?;
        let select = select_mut(&mut query)?;

        let mut replaced = false;
        for item in select.projection.iter_mut() {
            let hit = match item {
                SelectItem::ExprWithAlias { alias: a, .. } => a.value.eq_ignore_ascii_case(alias),
                SelectItem::UnnamedExpr(expr) => implicit_name(expr)
                    .is_some_and(|n| n.eq_ignore_ascii_case(alias)),
                _ => false,
            };
            if hit {
                *item = SelectItem::ExprWithAlias {
                    expr: new_expr.clone(),
                    alias: Ident::with_quote('"', alias),
                };
                replaced = true;
                break;
            }
        }
        if !replaced {
            return Err(Error::rewrite(format!("no projected column named '{alias}'")));
        }
        Ok(query.to_string())
    }

    fn inject_where(&self, sql: &str, condition: &str) -> Result<String> {
        let mut query = parse_query(sql)?;
        let filter = parse_expr(condition)?;
        match query.body.as_mut() {
            SetExpr::Select(select) => {
                select.selection = Some(match select.selection.take() {
                    Some(existing) => Expr::BinaryOp {
                        left: Box::new(Expr::Nested(Box::new(existing))),
                        op: BinaryOperator::And,
                        right: Box::new(Expr::Nested(Box::new(filter))),
                    },
                    None => filter,
                });
                Ok(query.to_string())
            }
            // UNION and friends: filter the combined result instead
            _ => Ok(format!(
                "SELECT * FROM ({query}) AS __filtered__ WHERE {filter}"
            )),
        }
    }
}

fn extract_from_query(query: &Query, refs: &mut Vec<String>, parent_ctes: &HashSet<String>) {
    let mut cte_names = parent_ctes.clone();

    if let Some(with) = &query.with {
        extract_from_with(with, refs, &mut cte_names);
    }

    extract_from_set_expr(&query.body, refs, &cte_names);
}

fn extract_from_with(with: &With, refs: &mut Vec<String>, cte_names: &mut HashSet<String>) {
    for cte in &with.cte_tables {
        cte_names.insert(cte.alias.name.value.clone());
        extract_from_query(&cte.query, refs, cte_names);
    }
}

fn extract_from_set_expr(set_expr: &SetExpr, refs: &mut Vec<String>, cte_names: &HashSet<String>) {
    match set_expr {
        SetExpr::Select(select) => extract_from_select(select, refs, cte_names),
        SetExpr::Query(query) => extract_from_query(query, refs, cte_names),
        SetExpr::SetOperation { left, right, .. } => {
            extract_from_set_expr(left, refs, cte_names);
            extract_from_set_expr(right, refs, cte_names);
        }
        _ => {}
    }
}

fn extract_from_select(select: &Select, refs: &mut Vec<String>, cte_names: &HashSet<String>) {
    for table_with_joins in &select.from {
        extract_from_table_with_joins(table_with_joins, refs, cte_names);
    }

    if let Some(selection) = &select.selection {
        extract_from_expr(selection, refs, cte_names);
    }
}

fn extract_from_table_with_joins(
    twj: &TableWithJoins,
    refs: &mut Vec<String>,
    cte_names: &HashSet<String>,
) {
    extract_from_table_factor(&twj.relation, refs, cte_names);
    for join in &twj.joins {
        extract_from_table_factor(&join.relation, refs, cte_names);
    }
}

fn extract_from_table_factor(
    factor: &TableFactor,
    refs: &mut Vec<String>,
    cte_names: &HashSet<String>,
) {
    match factor {
        TableFactor::Table { name, .. } => {
            if let Some(table_name) = object_name(name) {
                let is_cte = name.0.len() == 1 && cte_names.contains(&table_name);
                if !is_cte && !refs.contains(&table_name) {
                    refs.push(table_name);
                }
            }
        }
        TableFactor::Derived { subquery, .. } => {
            extract_from_query(subquery, refs, cte_names);
        }
        TableFactor::NestedJoin { table_with_joins, .. } => {
            extract_from_table_with_joins(table_with_joins, refs, cte_names);
        }
        _ => {}
    }
}

fn extract_from_expr(expr: &Expr, refs: &mut Vec<String>, cte_names: &HashSet<String>) {
    match expr {
        Expr::Subquery(query) => extract_from_query(query, refs, cte_names),
        Expr::InSubquery { subquery, .. } => extract_from_query(subquery, refs, cte_names),
        Expr::Exists { subquery, .. } => extract_from_query(subquery, refs, cte_names),
        Expr::BinaryOp { left, right, .. } => {
            extract_from_expr(left, refs, cte_names);
            extract_from_expr(right, refs, cte_names);
        }
        Expr::Nested(inner) => extract_from_expr(inner, refs, cte_names),
        _ => {}
    }
}
