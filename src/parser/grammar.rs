//! SQL Grammar/Parser
//!
//! A recursive descent parser over the token stream. One call to
//! `parse_next` yields one statement and leaves the parser positioned at
//! the start of the next, so that prepare can report the unparsed tail.

use crate::error::{Error, Result};
use crate::parser::ast::*;
use crate::parser::tokenizer::{tokenize, Spanned, Token};

/// Words that never act as bare identifiers or implicit aliases
const RESERVED: &[&str] = &[
    "ALL", "AND", "AS", "BETWEEN", "BY", "CASE", "CHECK", "COLLATE", "COMMIT", "CONSTRAINT", "CREATE",
    "CROSS", "DEFAULT", "DEFERRABLE", "DELETE", "DISTINCT", "DO", "DROP", "ELSE", "END", "ESCAPE",
    "EXCEPT", "EXISTS", "FOREIGN", "FROM", "FULL", "GLOB", "GROUP", "HAVING", "IN", "INDEX", "INDEXED",
    "INNER", "INSERT", "INTERSECT", "INTO", "IS", "ISNULL", "JOIN", "LEFT", "LIKE", "LIMIT", "NATURAL",
    "NOT", "NOTNULL", "NULL", "OFFSET", "ON", "OR", "ORDER", "OUTER", "PRIMARY", "REFERENCES",
    "RETURNING", "RIGHT", "SELECT", "SET", "TABLE", "THEN", "TO", "TRANSACTION", "UNION", "UNIQUE",
    "UPDATE", "USING", "VALUES", "WHEN", "WHERE", "WINDOW",
];

/// Words that end a column's type name
const COLUMN_CONSTRAINT_START: &[&str] = &[
    "CONSTRAINT", "PRIMARY", "NOT", "NULL", "UNIQUE", "CHECK", "DEFAULT", "COLLATE", "REFERENCES",
    "GENERATED", "AS",
];

// ============================================================================
// Parser
// ============================================================================

/// SQL parser
pub struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    /// Parameter names of the statement being parsed, by 1-based index
    params: Vec<Option<String>>,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str) -> Result<Self> {
        Ok(Parser {
            src,
            tokens: tokenize(src)?,
            pos: 0,
            params: Vec::new(),
        })
    }

    /// Parse the next statement; `None` once only semicolons remain
    pub fn parse_next(&mut self) -> Result<Option<Stmt>> {
        while self.eat_punct(";") {}
        if matches!(self.peek(), Token::Eof) {
            return Ok(None);
        }
        self.params.clear();
        let stmt = self.parse_stmt()?;
        if !self.eat_punct(";") && !matches!(self.peek(), Token::Eof) {
            return Err(self.syntax_error());
        }
        Ok(Some(stmt))
    }

    /// Byte offset of the first unparsed character
    pub fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.start).unwrap_or(self.src.len())
    }

    /// Parameter names for the last parsed statement (index 0 is `?1`)
    pub fn params(&self) -> &[Option<String>] {
        &self.params
    }

    // ========================================================================
    // Token helpers
    // ========================================================================

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> &Token {
        self.tokens
            .get(self.pos + n)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn check_kw(&self, kw: &str) -> bool {
        self.peek().is_keyword(kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.check_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.syntax_error())
        }
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.peek().is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.syntax_error())
        }
    }

    fn syntax_error(&self) -> Error {
        match self.peek() {
            Token::Eof => Error::sql("incomplete input"),
            t => Error::sql(format!("near \"{}\": syntax error", t.describe())),
        }
    }

    fn is_reserved(word: &str) -> bool {
        RESERVED.iter().any(|r| r.eq_ignore_ascii_case(word))
    }

    /// Whether the next token can serve as a name
    fn at_name(&self) -> bool {
        match self.peek() {
            Token::Ident { text, quoted } => *quoted || !Self::is_reserved(text),
            Token::String(_) => true,
            _ => false,
        }
    }

    fn name(&mut self) -> Result<String> {
        if !self.at_name() {
            return Err(self.syntax_error());
        }
        match self.advance() {
            Token::Ident { text, .. } | Token::String(text) => Ok(text),
            _ => Err(self.syntax_error()),
        }
    }

    /// `[schema.]name`; the schema qualifier is accepted and dropped
    fn qualified_name(&mut self) -> Result<String> {
        let first = self.name()?;
        if self.peek().is_punct(".") && matches!(self.peek_at(1), Token::Ident { .. }) {
            self.pos += 1;
            return self.name();
        }
        Ok(first)
    }

    fn name_list(&mut self) -> Result<Vec<String>> {
        self.expect_punct("(")?;
        let mut names = vec![self.name()?];
        while self.eat_punct(",") {
            names.push(self.name()?);
        }
        self.expect_punct(")")?;
        Ok(names)
    }

    fn if_not_exists(&mut self) -> Result<bool> {
        if self.eat_kw("IF") {
            self.expect_kw("NOT")?;
            self.expect_kw("EXISTS")?;
            return Ok(true);
        }
        Ok(false)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn parse_stmt(&mut self) -> Result<Stmt> {
        if self.eat_kw("EXPLAIN") {
            if self.eat_kw("QUERY") {
                self.expect_kw("PLAN")?;
            }
            return Ok(Stmt::Explain(Box::new(self.parse_stmt()?)));
        }
        if self.check_kw("WITH") {
            let with = self.parse_with()?;
            return self.parse_dml(Some(with));
        }
        match self.peek() {
            Token::Ident { text, quoted: false } => {
                let kw = text.to_ascii_uppercase();
                match kw.as_str() {
                    "SELECT" | "VALUES" | "INSERT" | "REPLACE" | "UPDATE" | "DELETE" => self.parse_dml(None),
                    "CREATE" => self.parse_create(),
                    "DROP" => self.parse_drop(),
                    "BEGIN" => {
                        self.pos += 1;
                        let _ = self.eat_kw("DEFERRED") || self.eat_kw("IMMEDIATE") || self.eat_kw("EXCLUSIVE");
                        self.eat_kw("TRANSACTION");
                        Ok(Stmt::Begin)
                    }
                    "COMMIT" | "END" => {
                        self.pos += 1;
                        self.eat_kw("TRANSACTION");
                        Ok(Stmt::Commit)
                    }
                    "ROLLBACK" => {
                        self.pos += 1;
                        self.eat_kw("TRANSACTION");
                        Ok(Stmt::Rollback)
                    }
                    _ => Err(self.syntax_error()),
                }
            }
            Token::Punct("(") => self.parse_dml(None),
            _ => Err(self.syntax_error()),
        }
    }

    fn parse_dml(&mut self, with: Option<With>) -> Result<Stmt> {
        if self.check_kw("INSERT") || self.check_kw("REPLACE") {
            let mut ins = self.parse_insert()?;
            ins.with = with;
            Ok(Stmt::Insert(Box::new(ins)))
        } else if self.check_kw("UPDATE") {
            let mut upd = self.parse_update()?;
            upd.with = with;
            Ok(Stmt::Update(Box::new(upd)))
        } else if self.check_kw("DELETE") {
            let mut del = self.parse_delete()?;
            del.with = with;
            Ok(Stmt::Delete(Box::new(del)))
        } else {
            let mut sel = self.parse_select()?;
            if with.is_some() {
                sel.with = with;
            }
            Ok(Stmt::Select(Box::new(sel)))
        }
    }

    fn parse_with(&mut self) -> Result<With> {
        self.expect_kw("WITH")?;
        let recursive = self.eat_kw("RECURSIVE");
        let mut ctes = Vec::new();
        loop {
            let name = self.name()?;
            let columns = if self.peek().is_punct("(") {
                self.name_list()?
            } else {
                Vec::new()
            };
            self.expect_kw("AS")?;
            if self.eat_kw("NOT") {
                self.expect_kw("MATERIALIZED")?;
            } else {
                self.eat_kw("MATERIALIZED");
            }
            self.expect_punct("(")?;
            let select = self.parse_select()?;
            self.expect_punct(")")?;
            ctes.push(Cte {
                name,
                columns,
                select: Box::new(select),
            });
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(With { recursive, ctes })
    }

    // ========================================================================
    // SELECT
    // ========================================================================

    /// Full select: compound chain, ORDER BY and LIMIT
    pub fn parse_select(&mut self) -> Result<Select> {
        let with = if self.check_kw("WITH") {
            Some(self.parse_with()?)
        } else {
            None
        };
        let mut sel = self.parse_select_core()?;
        loop {
            let op = if self.eat_kw("UNION") {
                if self.eat_kw("ALL") {
                    CompoundOp::UnionAll
                } else {
                    CompoundOp::Union
                }
            } else if self.eat_kw("INTERSECT") {
                CompoundOp::Intersect
            } else if self.eat_kw("EXCEPT") {
                CompoundOp::Except
            } else {
                break;
            };
            let rhs = self.parse_select_core()?;
            sel = attach_leftmost(rhs, op, sel);
        }
        if self.eat_kw("ORDER") {
            self.expect_kw("BY")?;
            sel.order_by = self.parse_ordering_terms()?;
        }
        if self.eat_kw("LIMIT") {
            let first = self.parse_expr()?;
            if self.eat_kw("OFFSET") {
                sel.limit = Some(first);
                sel.offset = Some(self.parse_expr()?);
            } else if self.eat_punct(",") {
                sel.offset = Some(first);
                sel.limit = Some(self.parse_expr()?);
            } else {
                sel.limit = Some(first);
            }
        }
        if with.is_some() {
            sel.with = with;
        }
        Ok(sel)
    }

    fn parse_select_core(&mut self) -> Result<Select> {
        if self.eat_kw("VALUES") {
            return self.parse_values();
        }
        if self.peek().is_punct("(") && (self.peek_at(1).is_keyword("SELECT") || self.peek_at(1).is_keyword("VALUES")) {
            // parenthesized select used as a compound term
            self.pos += 1;
            let inner = self.parse_select()?;
            self.expect_punct(")")?;
            let mut wrapper = Select::default();
            wrapper.columns.push(ResultColumn::Star);
            wrapper.from.push(SrcItem::subquery(inner));
            return Ok(wrapper);
        }
        self.expect_kw("SELECT")?;
        let mut sel = Select::default();
        if self.eat_kw("DISTINCT") {
            sel.distinct = true;
        } else {
            self.eat_kw("ALL");
        }
        sel.columns = self.parse_result_columns()?;
        if self.eat_kw("FROM") {
            sel.from = self.parse_from()?;
        }
        if self.eat_kw("WHERE") {
            sel.where_clause = Some(self.parse_expr()?);
        }
        if self.eat_kw("GROUP") {
            self.expect_kw("BY")?;
            sel.group_by = self.parse_expr_list()?;
            if self.eat_kw("HAVING") {
                sel.having = Some(self.parse_expr()?);
            }
        } else if self.eat_kw("HAVING") {
            sel.having = Some(self.parse_expr()?);
        }
        Ok(sel)
    }

    /// VALUES (..), (..): a UNION ALL chain of single-row selects
    fn parse_values(&mut self) -> Result<Select> {
        let mut chain: Option<Select> = None;
        loop {
            self.expect_punct("(")?;
            let row = self.parse_expr_list()?;
            self.expect_punct(")")?;
            let mut term = Select::values_row(row);
            if let Some(prev) = chain.take() {
                if prev.columns.len() != term.columns.len() {
                    return Err(Error::sql("all VALUES must have the same number of terms"));
                }
                term.op = CompoundOp::UnionAll;
                term.prior = Some(Box::new(prev));
            }
            chain = Some(term);
            if !self.eat_punct(",") {
                break;
            }
        }
        chain.ok_or_else(|| self.syntax_error())
    }

    fn parse_result_columns(&mut self) -> Result<Vec<ResultColumn>> {
        let mut cols = Vec::new();
        loop {
            if self.eat_punct("*") {
                cols.push(ResultColumn::Star);
            } else if matches!(self.peek(), Token::Ident { .. })
                && self.peek_at(1).is_punct(".")
                && self.peek_at(2).is_punct("*")
            {
                let table = self.name()?;
                self.pos += 2;
                cols.push(ResultColumn::TableStar(table));
            } else {
                let expr = self.parse_expr()?;
                let alias = self.parse_alias()?;
                cols.push(ResultColumn::Expr { expr, alias });
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(cols)
    }

    fn parse_alias(&mut self) -> Result<Option<String>> {
        if self.eat_kw("AS") {
            return Ok(Some(self.name()?));
        }
        if self.at_name() {
            return Ok(Some(self.name()?));
        }
        Ok(None)
    }

    fn parse_from(&mut self) -> Result<Vec<SrcItem>> {
        let mut items = vec![self.parse_table_or_subquery(JoinType::empty())?];
        loop {
            let join = if self.eat_punct(",") {
                JoinType::INNER
            } else if let Some(j) = self.parse_join_op()? {
                j
            } else {
                break;
            };
            let mut item = self.parse_table_or_subquery(join)?;
            if self.check_kw("ON") && !self.peek_at(1).is_keyword("CONFLICT") {
                self.pos += 1;
                item.on = Some(self.parse_expr()?);
            } else if self.eat_kw("USING") {
                item.using = self.name_list()?;
            }
            items.push(item);
        }
        Ok(items)
    }

    fn parse_join_op(&mut self) -> Result<Option<JoinType>> {
        let mut jt = JoinType::empty();
        let start = self.pos;
        if self.eat_kw("NATURAL") {
            jt |= JoinType::NATURAL;
        }
        if self.eat_kw("LEFT") {
            jt |= JoinType::LEFT | JoinType::OUTER;
            self.eat_kw("OUTER");
        } else if self.eat_kw("RIGHT") || self.eat_kw("FULL") {
            jt |= JoinType::RIGHT | JoinType::OUTER;
            self.eat_kw("OUTER");
        } else if self.eat_kw("INNER") {
            jt |= JoinType::INNER;
        } else if self.eat_kw("CROSS") {
            jt |= JoinType::INNER | JoinType::CROSS;
        }
        if self.eat_kw("JOIN") {
            if jt.is_empty() {
                jt = JoinType::INNER;
            }
            return Ok(Some(jt));
        }
        if self.pos != start {
            return Err(self.syntax_error());
        }
        Ok(None)
    }

    fn parse_table_or_subquery(&mut self, join: JoinType) -> Result<SrcItem> {
        let mut item = if self.eat_punct("(") {
            let sel = self.parse_select()?;
            self.expect_punct(")")?;
            SrcItem::subquery(sel)
        } else {
            SrcItem::table(self.qualified_name()?)
        };
        item.join = join;
        item.alias = self.parse_alias()?;
        if self.eat_kw("INDEXED") {
            self.expect_kw("BY")?;
            self.name()?;
        } else if self.check_kw("NOT") && self.peek_at(1).is_keyword("INDEXED") {
            self.pos += 2;
        }
        Ok(item)
    }

    fn parse_ordering_terms(&mut self) -> Result<Vec<OrderingTerm>> {
        let mut terms = Vec::new();
        loop {
            let mut term = OrderingTerm::new(self.parse_expr()?);
            if self.eat_kw("DESC") {
                term.order = SortOrder::Desc;
            } else {
                self.eat_kw("ASC");
            }
            if self.eat_kw("NULLS") {
                term.nulls = if self.eat_kw("FIRST") {
                    NullsOrder::First
                } else {
                    self.expect_kw("LAST")?;
                    NullsOrder::Last
                };
            }
            terms.push(term);
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(terms)
    }

    // ========================================================================
    // INSERT / UPDATE / DELETE
    // ========================================================================

    fn parse_conflict_action(&mut self) -> Result<ConflictAction> {
        let kw = match self.peek() {
            Token::Ident { text, quoted: false } => text.to_ascii_uppercase(),
            _ => return Err(self.syntax_error()),
        };
        let action = match kw.as_str() {
            "ROLLBACK" => ConflictAction::Rollback,
            "ABORT" => ConflictAction::Abort,
            "FAIL" => ConflictAction::Fail,
            "IGNORE" => ConflictAction::Ignore,
            "REPLACE" => ConflictAction::Replace,
            _ => return Err(self.syntax_error()),
        };
        self.pos += 1;
        Ok(action)
    }

    fn parse_or_conflict(&mut self) -> Result<Option<ConflictAction>> {
        if self.eat_kw("OR") {
            return Ok(Some(self.parse_conflict_action()?));
        }
        Ok(None)
    }

    fn parse_insert(&mut self) -> Result<InsertStmt> {
        let or_conflict = if self.eat_kw("REPLACE") {
            Some(ConflictAction::Replace)
        } else {
            self.expect_kw("INSERT")?;
            self.parse_or_conflict()?
        };
        self.expect_kw("INTO")?;
        let table = self.qualified_name()?;
        let alias = if self.eat_kw("AS") { Some(self.name()?) } else { None };
        let columns = if self.peek().is_punct("(") && !self.peek_at(1).is_keyword("SELECT") {
            self.name_list()?
        } else {
            Vec::new()
        };
        let source = if self.eat_kw("DEFAULT") {
            self.expect_kw("VALUES")?;
            InsertSource::DefaultValues
        } else {
            InsertSource::Select(Box::new(self.parse_select()?))
        };
        let mut upsert = Vec::new();
        while self.check_kw("ON") && self.peek_at(1).is_keyword("CONFLICT") {
            self.pos += 2;
            upsert.push(self.parse_upsert()?);
        }
        Ok(InsertStmt {
            with: None,
            or_conflict,
            table,
            alias,
            columns,
            source,
            upsert,
        })
    }

    fn parse_upsert(&mut self) -> Result<UpsertClause> {
        let mut target = Vec::new();
        let mut target_where = None;
        if self.eat_punct("(") {
            target = self.parse_indexed_columns()?;
            self.expect_punct(")")?;
            if self.eat_kw("WHERE") {
                target_where = Some(self.parse_expr()?);
            }
        }
        self.expect_kw("DO")?;
        let action = if self.eat_kw("NOTHING") {
            UpsertAction::Nothing
        } else {
            self.expect_kw("UPDATE")?;
            self.expect_kw("SET")?;
            let set = self.parse_assignments()?;
            let where_clause = if self.eat_kw("WHERE") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            UpsertAction::Update { set, where_clause }
        };
        Ok(UpsertClause {
            target,
            target_where,
            action,
        })
    }

    fn parse_assignments(&mut self) -> Result<Vec<Assignment>> {
        let mut out = Vec::new();
        loop {
            if self.peek().is_punct("(") {
                let names = self.name_list()?;
                self.expect_punct("=")?;
                self.expect_punct("(")?;
                let exprs = self.parse_expr_list()?;
                self.expect_punct(")")?;
                if names.len() != exprs.len() {
                    return Err(Error::sql(format!(
                        "{} columns assigned {} values",
                        names.len(),
                        exprs.len()
                    )));
                }
                for (column, expr) in names.into_iter().zip(exprs) {
                    out.push(Assignment { column, expr });
                }
            } else {
                let column = self.name()?;
                self.expect_punct("=")?;
                let expr = self.parse_expr()?;
                out.push(Assignment { column, expr });
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(out)
    }

    fn parse_update(&mut self) -> Result<UpdateStmt> {
        self.expect_kw("UPDATE")?;
        let or_conflict = self.parse_or_conflict()?;
        let table = self.qualified_name()?;
        let alias = if self.eat_kw("AS") { Some(self.name()?) } else { None };
        self.expect_kw("SET")?;
        let set = self.parse_assignments()?;
        let where_clause = if self.eat_kw("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(UpdateStmt {
            with: None,
            or_conflict,
            table,
            alias,
            set,
            where_clause,
        })
    }

    fn parse_delete(&mut self) -> Result<DeleteStmt> {
        self.expect_kw("DELETE")?;
        self.expect_kw("FROM")?;
        let table = self.qualified_name()?;
        let alias = if self.eat_kw("AS") { Some(self.name()?) } else { None };
        let where_clause = if self.eat_kw("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(DeleteStmt {
            with: None,
            table,
            alias,
            where_clause,
        })
    }

    // ========================================================================
    // CREATE / DROP
    // ========================================================================

    fn parse_create(&mut self) -> Result<Stmt> {
        self.expect_kw("CREATE")?;
        let _ = self.eat_kw("TEMP") || self.eat_kw("TEMPORARY");
        if self.eat_kw("TABLE") {
            return Ok(Stmt::CreateTable(Box::new(self.parse_create_table()?)));
        }
        let unique = self.eat_kw("UNIQUE");
        if self.eat_kw("INDEX") {
            return Ok(Stmt::CreateIndex(Box::new(self.parse_create_index(unique)?)));
        }
        if unique {
            return Err(self.syntax_error());
        }
        if self.eat_kw("VIEW") {
            let if_not_exists = self.if_not_exists()?;
            let name = self.qualified_name()?;
            let columns = if self.peek().is_punct("(") {
                self.name_list()?
            } else {
                Vec::new()
            };
            self.expect_kw("AS")?;
            let select = self.parse_select()?;
            return Ok(Stmt::CreateView(Box::new(CreateViewStmt {
                if_not_exists,
                name,
                columns,
                select: Box::new(select),
            })));
        }
        if self.eat_kw("TRIGGER") {
            return Ok(Stmt::CreateTrigger(Box::new(self.parse_create_trigger()?)));
        }
        Err(self.syntax_error())
    }

    fn parse_create_table(&mut self) -> Result<CreateTableStmt> {
        let if_not_exists = self.if_not_exists()?;
        let name = self.qualified_name()?;
        self.expect_punct("(")?;
        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        loop {
            if self.is_table_constraint_start() {
                constraints.push(self.parse_table_constraint()?);
            } else {
                if !constraints.is_empty() {
                    return Err(self.syntax_error());
                }
                columns.push(self.parse_column_def()?);
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        let mut without_rowid = false;
        if self.eat_kw("WITHOUT") {
            let word = self.name()?;
            if !word.eq_ignore_ascii_case("ROWID") {
                return Err(Error::sql(format!("unknown table option: {}", word)));
            }
            without_rowid = true;
        }
        Ok(CreateTableStmt {
            if_not_exists,
            name,
            columns,
            constraints,
            without_rowid,
        })
    }

    fn is_table_constraint_start(&self) -> bool {
        ["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"]
            .iter()
            .any(|k| self.check_kw(k))
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.name()?;
        let type_name = self.parse_type_name()?;
        let mut constraints = Vec::new();
        loop {
            let cname = if self.eat_kw("CONSTRAINT") {
                Some(self.name()?)
            } else {
                None
            };
            if self.eat_kw("PRIMARY") {
                self.expect_kw("KEY")?;
                let order = if self.eat_kw("DESC") {
                    SortOrder::Desc
                } else {
                    self.eat_kw("ASC");
                    SortOrder::Asc
                };
                let conflict = self.parse_constraint_conflict()?;
                let autoincrement = self.eat_kw("AUTOINCREMENT");
                constraints.push(ColumnConstraint::PrimaryKey {
                    order,
                    conflict,
                    autoincrement,
                });
            } else if self.check_kw("NOT") && self.peek_at(1).is_keyword("NULL") {
                self.pos += 2;
                let conflict = self.parse_constraint_conflict()?;
                constraints.push(ColumnConstraint::NotNull { conflict });
            } else if self.eat_kw("NULL") {
                constraints.push(ColumnConstraint::Null);
            } else if self.eat_kw("UNIQUE") {
                let conflict = self.parse_constraint_conflict()?;
                constraints.push(ColumnConstraint::Unique { conflict });
            } else if self.eat_kw("CHECK") {
                self.expect_punct("(")?;
                let expr = self.parse_expr()?;
                self.expect_punct(")")?;
                constraints.push(ColumnConstraint::Check { name: cname, expr });
            } else if self.eat_kw("DEFAULT") {
                constraints.push(ColumnConstraint::Default(self.parse_default_value()?));
            } else if self.eat_kw("COLLATE") {
                constraints.push(ColumnConstraint::Collate(self.name()?));
            } else if self.eat_kw("REFERENCES") {
                constraints.push(ColumnConstraint::References(self.parse_fk_clause()?));
            } else if cname.is_some() {
                return Err(self.syntax_error());
            } else {
                break;
            }
        }
        Ok(ColumnDef {
            name,
            type_name,
            constraints,
        })
    }

    fn parse_type_name(&mut self) -> Result<Option<String>> {
        let mut words: Vec<String> = Vec::new();
        while let Token::Ident { text, quoted } = self.peek() {
            if !*quoted && COLUMN_CONSTRAINT_START.iter().any(|k| k.eq_ignore_ascii_case(text)) {
                break;
            }
            words.push(text.clone());
            self.pos += 1;
        }
        if words.is_empty() {
            return Ok(None);
        }
        let mut name = words.join(" ");
        if self.eat_punct("(") {
            let mut args = Vec::new();
            loop {
                let neg = self.eat_punct("-");
                self.eat_punct("+");
                match self.advance() {
                    Token::Integer(i) => args.push(if neg { -i } else { i }.to_string()),
                    Token::Real(r) => args.push(r.to_string()),
                    _ => return Err(self.syntax_error()),
                }
                if !self.eat_punct(",") {
                    break;
                }
            }
            self.expect_punct(")")?;
            name = format!("{}({})", name, args.join(","));
        }
        Ok(Some(name))
    }

    fn parse_constraint_conflict(&mut self) -> Result<Option<ConflictAction>> {
        if self.check_kw("ON") && self.peek_at(1).is_keyword("CONFLICT") {
            self.pos += 2;
            return Ok(Some(self.parse_conflict_action()?));
        }
        Ok(None)
    }

    fn parse_default_value(&mut self) -> Result<Expr> {
        if self.eat_punct("(") {
            let e = self.parse_expr()?;
            self.expect_punct(")")?;
            return Ok(e);
        }
        if self.eat_punct("-") {
            return Ok(match self.parse_primary()? {
                Expr::Integer(i) => Expr::Integer(-i),
                Expr::Real(r) => Expr::Real(-r),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        self.eat_punct("+");
        self.parse_primary()
    }

    fn parse_fk_clause(&mut self) -> Result<ForeignKeyClause> {
        let table = self.name()?;
        let columns = if self.peek().is_punct("(") {
            self.name_list()?
        } else {
            Vec::new()
        };
        let mut clause = ForeignKeyClause {
            table,
            columns,
            on_delete: FkAction::NoAction,
            on_update: FkAction::NoAction,
        };
        loop {
            if self.eat_kw("ON") {
                let is_delete = if self.eat_kw("DELETE") {
                    true
                } else {
                    self.expect_kw("UPDATE")?;
                    false
                };
                let action = if self.eat_kw("CASCADE") {
                    FkAction::Cascade
                } else if self.eat_kw("RESTRICT") {
                    FkAction::Restrict
                } else if self.eat_kw("SET") {
                    if self.eat_kw("NULL") {
                        FkAction::SetNull
                    } else {
                        self.expect_kw("DEFAULT")?;
                        FkAction::SetDefault
                    }
                } else {
                    self.expect_kw("NO")?;
                    self.expect_kw("ACTION")?;
                    FkAction::NoAction
                };
                if is_delete {
                    clause.on_delete = action;
                } else {
                    clause.on_update = action;
                }
            } else if self.eat_kw("MATCH") {
                self.name()?;
            } else if self.check_kw("DEFERRABLE") || (self.check_kw("NOT") && self.peek_at(1).is_keyword("DEFERRABLE")) {
                self.eat_kw("NOT");
                self.pos += 1;
                if self.eat_kw("INITIALLY") {
                    let _ = self.eat_kw("DEFERRED") || self.eat_kw("IMMEDIATE");
                }
            } else {
                break;
            }
        }
        Ok(clause)
    }

    fn parse_table_constraint(&mut self) -> Result<TableConstraint> {
        let name = if self.eat_kw("CONSTRAINT") {
            Some(self.name()?)
        } else {
            None
        };
        if self.eat_kw("PRIMARY") {
            self.expect_kw("KEY")?;
            self.expect_punct("(")?;
            let columns = self.parse_indexed_columns()?;
            let autoincrement = self.eat_kw("AUTOINCREMENT");
            self.expect_punct(")")?;
            let conflict = self.parse_constraint_conflict()?;
            Ok(TableConstraint::PrimaryKey {
                name,
                columns,
                conflict,
                autoincrement,
            })
        } else if self.eat_kw("UNIQUE") {
            self.expect_punct("(")?;
            let columns = self.parse_indexed_columns()?;
            self.expect_punct(")")?;
            let conflict = self.parse_constraint_conflict()?;
            Ok(TableConstraint::Unique {
                name,
                columns,
                conflict,
            })
        } else if self.eat_kw("CHECK") {
            self.expect_punct("(")?;
            let expr = self.parse_expr()?;
            self.expect_punct(")")?;
            Ok(TableConstraint::Check { name, expr })
        } else if self.eat_kw("FOREIGN") {
            self.expect_kw("KEY")?;
            let columns = self.name_list()?;
            self.expect_kw("REFERENCES")?;
            let clause = self.parse_fk_clause()?;
            Ok(TableConstraint::ForeignKey { name, columns, clause })
        } else {
            Err(self.syntax_error())
        }
    }

    fn parse_indexed_columns(&mut self) -> Result<Vec<IndexedColumn>> {
        let mut cols = Vec::new();
        loop {
            let mut expr = self.parse_expr()?;
            let mut collation = None;
            if let Expr::Collate { expr: inner, collation: c } = expr {
                collation = Some(c);
                expr = *inner;
            }
            let order = if self.eat_kw("DESC") {
                SortOrder::Desc
            } else {
                self.eat_kw("ASC");
                SortOrder::Asc
            };
            cols.push(IndexedColumn { expr, collation, order });
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(cols)
    }

    fn parse_create_index(&mut self, unique: bool) -> Result<CreateIndexStmt> {
        let if_not_exists = self.if_not_exists()?;
        let name = self.qualified_name()?;
        self.expect_kw("ON")?;
        let table = self.name()?;
        self.expect_punct("(")?;
        let columns = self.parse_indexed_columns()?;
        self.expect_punct(")")?;
        let where_clause = if self.eat_kw("WHERE") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(CreateIndexStmt {
            unique,
            if_not_exists,
            name,
            table,
            columns,
            where_clause,
        })
    }

    fn parse_create_trigger(&mut self) -> Result<CreateTriggerStmt> {
        let if_not_exists = self.if_not_exists()?;
        let name = self.qualified_name()?;
        let timing = if self.eat_kw("BEFORE") {
            TriggerTiming::Before
        } else if self.eat_kw("AFTER") {
            TriggerTiming::After
        } else if self.eat_kw("INSTEAD") {
            self.expect_kw("OF")?;
            TriggerTiming::InsteadOf
        } else {
            TriggerTiming::Before
        };
        let event = if self.eat_kw("INSERT") {
            TriggerEvent::Insert
        } else if self.eat_kw("DELETE") {
            TriggerEvent::Delete
        } else {
            self.expect_kw("UPDATE")?;
            let mut cols = Vec::new();
            if self.eat_kw("OF") {
                cols.push(self.name()?);
                while self.eat_punct(",") {
                    cols.push(self.name()?);
                }
            }
            TriggerEvent::Update(cols)
        };
        self.expect_kw("ON")?;
        let table = self.qualified_name()?;
        if self.eat_kw("FOR") {
            self.expect_kw("EACH")?;
            self.expect_kw("ROW")?;
        }
        let when = if self.eat_kw("WHEN") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect_kw("BEGIN")?;
        let mut body = Vec::new();
        loop {
            if self.eat_kw("END") {
                break;
            }
            let stmt = if self.check_kw("WITH") {
                let with = self.parse_with()?;
                self.parse_dml(Some(with))?
            } else {
                self.parse_dml(None)?
            };
            body.push(stmt);
            self.expect_punct(";")?;
        }
        if body.is_empty() {
            return Err(self.syntax_error());
        }
        Ok(CreateTriggerStmt {
            if_not_exists,
            name,
            timing,
            event,
            table,
            when,
            body,
        })
    }

    fn parse_drop(&mut self) -> Result<Stmt> {
        self.expect_kw("DROP")?;
        let kind = if self.eat_kw("TABLE") {
            ObjectKind::Table
        } else if self.eat_kw("INDEX") {
            ObjectKind::Index
        } else if self.eat_kw("VIEW") {
            ObjectKind::View
        } else if self.eat_kw("TRIGGER") {
            ObjectKind::Trigger
        } else {
            return Err(self.syntax_error());
        };
        let if_exists = if self.eat_kw("IF") {
            self.expect_kw("EXISTS")?;
            true
        } else {
            false
        };
        let name = self.qualified_name()?;
        Ok(Stmt::Drop(DropStmt { kind, if_exists, name }))
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>> {
        let mut list = vec![self.parse_expr()?];
        while self.eat_punct(",") {
            list.push(self.parse_expr()?);
        }
        Ok(list)
    }

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_kw("OR") {
            let right = self.parse_and()?;
            left = Expr::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_kw("AND") {
            let right = self.parse_not()?;
            left = Expr::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat_kw("NOT") {
            let e = self.parse_not()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(e)));
        }
        self.parse_equality()
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            if self.eat_punct("=") {
                let r = self.parse_comparison()?;
                left = Expr::binary(BinaryOp::Eq, left, r);
            } else if self.eat_punct("<>") {
                let r = self.parse_comparison()?;
                left = Expr::binary(BinaryOp::Ne, left, r);
            } else if self.eat_kw("IS") {
                let negated = self.eat_kw("NOT");
                if self.eat_kw("NULL") {
                    left = if negated {
                        Expr::NotNull(Box::new(left))
                    } else {
                        Expr::IsNull(Box::new(left))
                    };
                    continue;
                }
                let mut op = if negated { BinaryOp::IsNot } else { BinaryOp::Is };
                if self.eat_kw("DISTINCT") {
                    self.expect_kw("FROM")?;
                    op = if negated { BinaryOp::Is } else { BinaryOp::IsNot };
                }
                let r = self.parse_comparison()?;
                left = Expr::binary(op, left, r);
            } else if self.eat_kw("ISNULL") {
                left = Expr::IsNull(Box::new(left));
            } else if self.eat_kw("NOTNULL") {
                left = Expr::NotNull(Box::new(left));
            } else if self.check_kw("NOT") && self.peek_at(1).is_keyword("NULL") {
                self.pos += 2;
                left = Expr::NotNull(Box::new(left));
            } else {
                let negated = if self.check_kw("NOT")
                    && ["IN", "LIKE", "GLOB", "BETWEEN"].iter().any(|k| self.peek_at(1).is_keyword(k))
                {
                    self.pos += 1;
                    true
                } else {
                    false
                };
                if self.eat_kw("IN") {
                    left = self.parse_in(left, negated)?;
                } else if self.check_kw("LIKE") || self.check_kw("GLOB") {
                    let op = if self.eat_kw("LIKE") {
                        LikeOp::Like
                    } else {
                        self.pos += 1;
                        LikeOp::Glob
                    };
                    let pattern = self.parse_comparison()?;
                    let escape = if self.eat_kw("ESCAPE") {
                        Some(Box::new(self.parse_comparison()?))
                    } else {
                        None
                    };
                    left = Expr::Like {
                        op,
                        expr: Box::new(left),
                        pattern: Box::new(pattern),
                        escape,
                        negated,
                    };
                } else if self.eat_kw("BETWEEN") {
                    let low = self.parse_comparison()?;
                    self.expect_kw("AND")?;
                    let high = self.parse_comparison()?;
                    left = Expr::Between {
                        expr: Box::new(left),
                        low: Box::new(low),
                        high: Box::new(high),
                        negated,
                    };
                } else {
                    break;
                }
            }
        }
        Ok(left)
    }

    fn parse_in(&mut self, left: Expr, negated: bool) -> Result<Expr> {
        if !self.peek().is_punct("(") {
            // IN table
            let name = self.qualified_name()?;
            let mut sel = Select::default();
            sel.columns.push(ResultColumn::Star);
            sel.from.push(SrcItem::table(name));
            return Ok(Expr::InSelect {
                expr: Box::new(left),
                select: Box::new(sel),
                negated,
            });
        }
        self.pos += 1;
        if self.check_kw("SELECT") || self.check_kw("VALUES") || self.check_kw("WITH") {
            let sel = self.parse_select()?;
            self.expect_punct(")")?;
            return Ok(Expr::InSelect {
                expr: Box::new(left),
                select: Box::new(sel),
                negated,
            });
        }
        let list = if self.peek().is_punct(")") {
            Vec::new()
        } else {
            self.parse_expr_list()?
        };
        self.expect_punct(")")?;
        Ok(Expr::InList {
            expr: Box::new(left),
            list,
            negated,
        })
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut left = self.parse_bitwise()?;
        loop {
            let op = match self.peek() {
                Token::Punct("<") => BinaryOp::Lt,
                Token::Punct("<=") => BinaryOp::Le,
                Token::Punct(">") => BinaryOp::Gt,
                Token::Punct(">=") => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let r = self.parse_bitwise()?;
            left = Expr::binary(op, left, r);
        }
        Ok(left)
    }

    fn parse_bitwise(&mut self) -> Result<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Punct("&") => BinaryOp::BitAnd,
                Token::Punct("|") => BinaryOp::BitOr,
                Token::Punct("<<") => BinaryOp::ShiftLeft,
                Token::Punct(">>") => BinaryOp::ShiftRight,
                _ => break,
            };
            self.pos += 1;
            let r = self.parse_additive()?;
            left = Expr::binary(op, left, r);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Punct("+") => BinaryOp::Add,
                Token::Punct("-") => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let r = self.parse_multiplicative()?;
            left = Expr::binary(op, left, r);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.peek() {
                Token::Punct("*") => BinaryOp::Mul,
                Token::Punct("/") => BinaryOp::Div,
                Token::Punct("%") => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let r = self.parse_concat()?;
            left = Expr::binary(op, left, r);
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<Expr> {
        let mut left = self.parse_collate()?;
        while self.eat_punct("||") {
            let r = self.parse_collate()?;
            left = Expr::binary(BinaryOp::Concat, left, r);
        }
        Ok(left)
    }

    fn parse_collate(&mut self) -> Result<Expr> {
        let mut e = self.parse_unary()?;
        while self.eat_kw("COLLATE") {
            let collation = self.name()?;
            e = Expr::Collate {
                expr: Box::new(e),
                collation,
            };
        }
        Ok(e)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat_punct("-") {
            if let Token::BigInteger(text) = self.peek() {
                if text == "9223372036854775808" {
                    self.pos += 1;
                    return Ok(Expr::Integer(i64::MIN));
                }
            }
            let e = self.parse_unary()?;
            return Ok(match e {
                Expr::Integer(i) if i != i64::MIN => Expr::Integer(-i),
                Expr::Real(r) => Expr::Real(-r),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        if self.eat_punct("+") {
            let e = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Pos, Box::new(e)));
        }
        if self.eat_punct("~") {
            let e = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::BitNot, Box::new(e)));
        }
        self.parse_primary()
    }

    fn variable_index(&mut self, text: &str) -> Result<i32> {
        if text == "?" {
            self.params.push(None);
            return Ok(self.params.len() as i32);
        }
        if let Some(num) = text.strip_prefix('?') {
            let n: usize = num
                .parse()
                .ok()
                .filter(|n| *n >= 1 && *n <= 32766)
                .ok_or_else(|| Error::sql("variable number must be between ?1 and ?32766"))?;
            if self.params.len() < n {
                self.params.resize(n, None);
            }
            return Ok(n as i32);
        }
        if let Some(i) = self.params.iter().position(|p| p.as_deref() == Some(text)) {
            return Ok(i as i32 + 1);
        }
        self.params.push(Some(text.to_string()));
        Ok(self.params.len() as i32)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let tok = self.peek().clone();
        match tok {
            Token::Integer(i) => {
                self.pos += 1;
                Ok(Expr::Integer(i))
            }
            Token::BigInteger(text) => {
                self.pos += 1;
                Ok(Expr::Real(text.parse::<f64>().unwrap_or(f64::MAX)))
            }
            Token::Real(r) => {
                self.pos += 1;
                Ok(Expr::Real(r))
            }
            Token::String(s) => {
                self.pos += 1;
                Ok(Expr::Text(s))
            }
            Token::Blob(b) => {
                self.pos += 1;
                Ok(Expr::Blob(b))
            }
            Token::Variable(v) => {
                self.pos += 1;
                Ok(Expr::Variable(self.variable_index(&v)?))
            }
            Token::Punct("(") => {
                self.pos += 1;
                if self.check_kw("SELECT") || self.check_kw("VALUES") || self.check_kw("WITH") {
                    let sel = self.parse_select()?;
                    self.expect_punct(")")?;
                    return Ok(Expr::Subquery(Box::new(sel)));
                }
                let e = self.parse_expr()?;
                if self.peek().is_punct(",") {
                    return Err(Error::sql("row value misused"));
                }
                self.expect_punct(")")?;
                Ok(e)
            }
            Token::Ident { ref text, quoted: false } => {
                let upper = text.to_ascii_uppercase();
                match upper.as_str() {
                    "NULL" => {
                        self.pos += 1;
                        Ok(Expr::Null)
                    }
                    "TRUE" if !self.peek_at(1).is_punct("(") => {
                        self.pos += 1;
                        Ok(Expr::Integer(1))
                    }
                    "FALSE" if !self.peek_at(1).is_punct("(") => {
                        self.pos += 1;
                        Ok(Expr::Integer(0))
                    }
                    "CURRENT_TIME" => {
                        self.pos += 1;
                        Ok(Expr::CurrentTime(TimeKeyword::Time))
                    }
                    "CURRENT_DATE" => {
                        self.pos += 1;
                        Ok(Expr::CurrentTime(TimeKeyword::Date))
                    }
                    "CURRENT_TIMESTAMP" => {
                        self.pos += 1;
                        Ok(Expr::CurrentTime(TimeKeyword::Timestamp))
                    }
                    "CAST" => {
                        self.pos += 1;
                        self.expect_punct("(")?;
                        let e = self.parse_expr()?;
                        self.expect_kw("AS")?;
                        let type_name = self.parse_type_name()?.unwrap_or_default();
                        self.expect_punct(")")?;
                        Ok(Expr::Cast {
                            expr: Box::new(e),
                            type_name,
                        })
                    }
                    "CASE" => {
                        self.pos += 1;
                        self.parse_case()
                    }
                    "EXISTS" => {
                        self.pos += 1;
                        self.expect_punct("(")?;
                        let sel = self.parse_select()?;
                        self.expect_punct(")")?;
                        Ok(Expr::Exists(Box::new(sel)))
                    }
                    "RAISE" => {
                        self.pos += 1;
                        self.parse_raise()
                    }
                    _ if Self::is_reserved(text) && !self.peek_at(1).is_punct("(") => Err(self.syntax_error()),
                    _ => self.parse_name_expr(),
                }
            }
            Token::Ident { .. } => self.parse_name_expr(),
            _ => Err(self.syntax_error()),
        }
    }

    /// Identifier, qualified column reference, or function call
    fn parse_name_expr(&mut self) -> Result<Expr> {
        let name = match self.advance() {
            Token::Ident { text, .. } => text,
            _ => return Err(self.syntax_error()),
        };
        if self.eat_punct("(") {
            return self.parse_function(name);
        }
        if self.eat_punct(".") {
            let second = self.name()?;
            if self.eat_punct(".") {
                // schema.table.column
                let third = self.name()?;
                return Ok(Expr::Qualified(second, third));
            }
            return Ok(Expr::Qualified(name, second));
        }
        Ok(Expr::Id(name))
    }

    fn parse_function(&mut self, name: String) -> Result<Expr> {
        if self.eat_punct("*") {
            self.expect_punct(")")?;
            return Ok(Expr::Function {
                name,
                args: Vec::new(),
                distinct: false,
                star: true,
            });
        }
        let distinct = self.eat_kw("DISTINCT");
        let args = if self.peek().is_punct(")") {
            Vec::new()
        } else {
            self.parse_expr_list()?
        };
        self.expect_punct(")")?;
        if self.check_kw("FILTER") || self.check_kw("OVER") {
            return Err(Error::sql(format!("window functions are not supported: {}", name)));
        }
        Ok(Expr::Function {
            name,
            args,
            distinct,
            star: false,
        })
    }

    fn parse_case(&mut self) -> Result<Expr> {
        let operand = if self.check_kw("WHEN") {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let mut whens = Vec::new();
        while self.eat_kw("WHEN") {
            let w = self.parse_expr()?;
            self.expect_kw("THEN")?;
            let t = self.parse_expr()?;
            whens.push((w, t));
        }
        if whens.is_empty() {
            return Err(self.syntax_error());
        }
        let else_expr = if self.eat_kw("ELSE") {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        self.expect_kw("END")?;
        Ok(Expr::Case {
            operand,
            whens,
            else_expr,
        })
    }

    fn parse_raise(&mut self) -> Result<Expr> {
        self.expect_punct("(")?;
        let action = if self.eat_kw("IGNORE") {
            RaiseAction::Ignore
        } else if self.eat_kw("ROLLBACK") {
            RaiseAction::Rollback
        } else if self.eat_kw("ABORT") {
            RaiseAction::Abort
        } else if self.eat_kw("FAIL") {
            RaiseAction::Fail
        } else {
            return Err(self.syntax_error());
        };
        let message = if action != RaiseAction::Ignore {
            self.expect_punct(",")?;
            match self.advance() {
                Token::String(s) => Some(s),
                _ => return Err(self.syntax_error()),
            }
        } else {
            None
        };
        self.expect_punct(")")?;
        Ok(Expr::Raise(action, message))
    }
}

/// Link `prior` as the left operand of the leftmost term of `chain`
fn attach_leftmost(mut chain: Select, op: CompoundOp, prior: Select) -> Select {
    match chain.prior.take() {
        Some(inner) => {
            chain.prior = Some(Box::new(attach_leftmost(*inner, op, prior)));
        }
        None => {
            chain.op = op;
            chain.prior = Some(Box::new(prior));
        }
    }
    chain
}

/// Parse every statement of a script
pub fn parse(sql: &str) -> Result<Vec<Stmt>> {
    let mut p = Parser::new(sql)?;
    let mut out = Vec::new();
    while let Some(stmt) = p.parse_next()? {
        out.push(stmt);
    }
    Ok(out)
}

/// Parse a single expression (used for DEFAULT and CHECK round trips in tests)
pub fn parse_expr(sql: &str) -> Result<Expr> {
    let mut p = Parser::new(sql)?;
    let e = p.parse_expr()?;
    if !matches!(p.peek(), Token::Eof) {
        return Err(p.syntax_error());
    }
    Ok(e)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn one(sql: &str) -> Stmt {
        let mut v = parse(sql).unwrap();
        assert_eq!(v.len(), 1);
        v.remove(0)
    }

    #[test]
    fn test_parse_select_with_join_and_group() {
        let Stmt::Select(sel) = one("SELECT a, count(*) AS n FROM t LEFT JOIN u ON t.x = u.y WHERE a > 1 GROUP BY a HAVING n > 2 ORDER BY 2 DESC LIMIT 5 OFFSET 1") else {
            panic!("expected select");
        };
        assert_eq!(sel.columns.len(), 2);
        assert_eq!(sel.from.len(), 2);
        assert!(sel.from[1].join.is_left());
        assert!(sel.from[1].on.is_some());
        assert_eq!(sel.group_by.len(), 1);
        assert!(sel.having.is_some());
        assert!(sel.order_by[0].is_desc());
        assert_eq!(sel.limit, Some(Expr::Integer(5)));
        assert_eq!(sel.offset, Some(Expr::Integer(1)));
    }

    #[test]
    fn test_compound_chain_orders_left_to_right() {
        let Stmt::Select(sel) = one("SELECT 1 UNION SELECT 2 EXCEPT SELECT 3 ORDER BY 1") else {
            panic!("expected select");
        };
        assert_eq!(sel.op, CompoundOp::Except);
        let mid = sel.prior.as_ref().unwrap();
        assert_eq!(mid.op, CompoundOp::Union);
        assert!(mid.prior.as_ref().unwrap().prior.is_none());
        assert_eq!(sel.order_by.len(), 1);
    }

    #[test]
    fn test_multi_row_values_is_union_all_chain() {
        let Stmt::Insert(ins) = one("INSERT INTO t VALUES (1, 2), (3, 4), (5, 6)") else {
            panic!("expected insert");
        };
        let InsertSource::Select(sel) = &ins.source else {
            panic!("expected select source");
        };
        assert_eq!(sel.terms().count(), 3);
        assert!(sel.terms().all(|s| s.flags.contains(SelectFlags::VALUES)));
    }

    #[test]
    fn test_upsert_clause() {
        let Stmt::Insert(ins) = one(
            "INSERT INTO t(a, b) SELECT x, y FROM s WHERE true ON CONFLICT(a) DO UPDATE SET b = excluded.b WHERE b < 10",
        ) else {
            panic!("expected insert");
        };
        assert_eq!(ins.upsert.len(), 1);
        assert_eq!(ins.upsert[0].target[0].column_name(), Some("a"));
        assert!(matches!(ins.upsert[0].action, UpsertAction::Update { .. }));
    }

    #[test]
    fn test_create_table_constraints() {
        let Stmt::CreateTable(ct) = one(
            "CREATE TABLE t(a INTEGER PRIMARY KEY AUTOINCREMENT, b TEXT NOT NULL ON CONFLICT REPLACE DEFAULT 'x', c UNIQUE, CHECK(c > 0))",
        ) else {
            panic!("expected create table");
        };
        assert_eq!(ct.columns.len(), 3);
        assert_eq!(ct.columns[0].type_name.as_deref(), Some("INTEGER"));
        assert!(matches!(
            ct.columns[1].constraints[0],
            ColumnConstraint::NotNull { conflict: Some(ConflictAction::Replace) }
        ));
        assert_eq!(ct.constraints.len(), 1);
    }

    #[test]
    fn test_precedence() {
        let e = parse_expr("1 + 2 * 3 = 7 AND NOT x IS NULL").unwrap();
        let Expr::Binary(BinaryOp::And, l, r) = e else {
            panic!("expected AND");
        };
        assert!(matches!(*l, Expr::Binary(BinaryOp::Eq, _, _)));
        assert!(matches!(*r, Expr::Unary(UnaryOp::Not, _)));
    }

    #[test]
    fn test_variables_numbering() {
        let mut p = Parser::new("SELECT ?, :a, ?5, :a").unwrap();
        p.parse_next().unwrap();
        assert_eq!(p.params().len(), 5);
        assert_eq!(p.params()[1].as_deref(), Some(":a"));
    }

    #[test]
    fn test_trigger_body() {
        let Stmt::CreateTrigger(tr) = one(
            "CREATE TRIGGER r AFTER UPDATE OF b ON t FOR EACH ROW WHEN new.b > 0 BEGIN INSERT INTO log VALUES(new.a); DELETE FROM x; END",
        ) else {
            panic!("expected trigger");
        };
        assert_eq!(tr.body.len(), 2);
        assert_eq!(tr.event, TriggerEvent::Update(vec!["b".into()]));
    }

    #[test]
    fn test_syntax_error_message() {
        let err = parse("SELECT FROM").unwrap_err();
        assert_eq!(err.errmsg(), "near \"FROM\": syntax error");
        assert_eq!(parse("SELECT (1").unwrap_err().errmsg(), "incomplete input");
    }

    #[test]
    fn test_offset_reports_tail() {
        let sql = "SELECT 1; SELECT 2";
        let mut p = Parser::new(sql).unwrap();
        p.parse_next().unwrap();
        assert_eq!(&sql[p.offset()..], "SELECT 2");
    }
}
