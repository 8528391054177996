//! Static access-pattern extraction over the typed AST.
//!
//! Walks every `for` nest of a translation unit and classifies each array
//! subscript and struct member access into an [`AccessPatternKind`]. The
//! classification is purely syntactic: induction variables come from the
//! loop init clause, strides from the increment clause, and index shapes
//! from the subscript expression.

use crate::ast::{
    BinaryOp, Expr, ExprKind, ForStmt, Stmt, TranslationUnit, UnaryOp, VarDecl,
};
use crate::context::Context;
use crate::error::{AnalysisError, Result};
use crate::source_location::SourceLocation;
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_STRUCT_FIELDS: usize = 32;

/// How an access site moves through memory as its enclosing loop advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AccessPatternKind {
    Sequential,
    Strided { stride: i64 },
    Random,
    GatherScatter,
    LoopCarriedDep,
    NestedLoop { outer_stride: i64 },
    Indirect,
}

impl AccessPatternKind {
    pub fn is_strided(&self) -> bool {
        matches!(self, AccessPatternKind::Strided { .. })
    }

    /// Stride carried by the kind itself, when it has one.
    pub fn stride(&self) -> Option<i64> {
        match self {
            AccessPatternKind::Sequential => Some(1),
            AccessPatternKind::Strided { stride } => Some(*stride),
            AccessPatternKind::NestedLoop { outer_stride } => Some(*outer_stride),
            AccessPatternKind::LoopCarriedDep => Some(-1),
            _ => None,
        }
    }
}

impl fmt::Display for AccessPatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessPatternKind::Sequential => write!(f, "sequential"),
            AccessPatternKind::Strided { stride } => write!(f, "strided({})", stride),
            AccessPatternKind::Random => write!(f, "random"),
            AccessPatternKind::GatherScatter => write!(f, "gather/scatter"),
            AccessPatternKind::LoopCarriedDep => write!(f, "loop-carried dependency"),
            AccessPatternKind::NestedLoop { outer_stride } => {
                write!(f, "nested-loop(outer stride {})", outer_stride)
            }
            AccessPatternKind::Indirect => write!(f, "indirect"),
        }
    }
}

/// One classified access site inside a loop nest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticPattern {
    pub location: SourceLocation,
    pub array_name: String,
    pub index_var: String,
    pub loop_depth: u32,
    pub kind: AccessPatternKind,
    pub stride: i64,
    pub is_pointer_access: bool,
    pub is_struct_access: bool,
    pub is_indirect_index: bool,
    pub has_dependencies: bool,
    pub estimated_footprint_bytes: u64,
}

/// Per-loop summary with the access patterns collected inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopInfo {
    pub location: SourceLocation,
    pub loop_var: String,
    pub condition_text: String,
    pub increment_text: String,
    pub nest_level: u32,
    pub estimated_trip_count: Option<u64>,
    pub has_nested_loops: bool,
    pub has_function_calls: bool,
    pub patterns: Vec<StaticPattern>,
}

impl LoopInfo {
    /// Largest absolute stride among this loop's access patterns.
    pub fn max_abs_stride(&self) -> i64 {
        self.patterns
            .iter()
            .map(|p| p.stride.abs())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub offset_bytes: u64,
    pub size_bytes: u64,
}

/// Record layout as seen by the false-sharing and layout advisors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructInfo {
    pub name: String,
    pub location: SourceLocation,
    pub fields: ArrayVec<FieldInfo, MAX_STRUCT_FIELDS>,
    pub total_size_bytes: u64,
    pub has_pointer_fields: bool,
    pub is_packed: bool,
}

/// Everything extracted from one translation unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub patterns: Vec<StaticPattern>,
    pub loops: Vec<LoopInfo>,
    pub structs: Vec<StructInfo>,
    pub diagnostics: Vec<String>,
}

struct LoopContext {
    location: SourceLocation,
    loop_var: String,
    stride: Option<i64>,
    depth: u32,
    trip_count: Option<u64>,
    has_nested_loops: bool,
    has_function_calls: bool,
    patterns: Vec<StaticPattern>,
    loops_index: usize,
}

pub struct PatternExtractor<'a> {
    ctx: &'a Context,
}

impl<'a> PatternExtractor<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Extracts `(patterns, loops, structs, diagnostics)` from one unit.
    /// A fatal frontend diagnostic fails this unit only.
    pub fn extract(&self, tu: &TranslationUnit) -> Result<ExtractionResult> {
        if let Some(diag) = &tu.fatal_diagnostic {
            return Err(AnalysisError::ExtractorFailed { diag: diag.clone() });
        }

        let mut state = WalkState {
            main_file: &tu.main_file,
            element_size: u64::from(self.ctx.config().element_size),
            nested_outer_stride: self.ctx.config().nested_outer_stride,
            loop_stack: Vec::new(),
            result: ExtractionResult::default(),
        };

        for stmt in &tu.stmts {
            state.walk_stmt(stmt);
        }
        state.collect_structs(tu);

        tracing::debug!(
            file = %tu.main_file,
            patterns = state.result.patterns.len(),
            loops = state.result.loops.len(),
            structs = state.result.structs.len(),
            "static extraction finished"
        );
        Ok(state.result)
    }
}

struct WalkState<'a> {
    main_file: &'a str,
    element_size: u64,
    nested_outer_stride: i64,
    loop_stack: Vec<LoopContext>,
    result: ExtractionResult,
}

impl WalkState<'_> {
    fn walk_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::For(f) => self.enter_for(f),
            Stmt::While(w) | Stmt::DoWhile(w) => {
                // Not opened as a loop context; only influences nesting.
                if w.location.file == self.main_file {
                    if let Some(parent) = self.loop_stack.last_mut() {
                        parent.has_nested_loops = true;
                    }
                    for s in &w.body {
                        self.walk_stmt(s);
                    }
                }
            }
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.walk_stmt(s);
                }
            }
            Stmt::Expr(e) => self.walk_expr(e),
            Stmt::Decl(d) => {
                if let Some(init) = &d.init {
                    self.walk_expr(init);
                }
            }
        }
    }

    fn enter_for(&mut self, f: &ForStmt) {
        if f.location.file != self.main_file {
            // Header code is never recorded.
            return;
        }
        if let Some(parent) = self.loop_stack.last_mut() {
            parent.has_nested_loops = true;
        }

        let loop_var = f.init.as_ref().map(|d| d.name.clone()).unwrap_or_default();
        let stride = f.increment.as_ref().and_then(|inc| derive_stride(inc, &loop_var));
        if stride.is_none() {
            self.result.diagnostics.push(format!(
                "unknown induction stride for loop at {}",
                f.location
            ));
        }
        let trip_count = estimate_trip_count(&f.init, &f.condition, stride);

        // Outer loops land before their inners in the output.
        let loops_index = self.result.loops.len();
        self.result.loops.push(LoopInfo {
            location: f.location.clone(),
            loop_var: loop_var.clone(),
            condition_text: f.condition.as_ref().map(|c| c.to_string()).unwrap_or_default(),
            increment_text: f.increment.as_ref().map(|i| i.to_string()).unwrap_or_default(),
            nest_level: self.loop_stack.len() as u32 + 1,
            estimated_trip_count: trip_count,
            has_nested_loops: false,
            has_function_calls: false,
            patterns: Vec::new(),
        });

        self.loop_stack.push(LoopContext {
            location: f.location.clone(),
            loop_var,
            stride,
            depth: self.loop_stack.len() as u32 + 1,
            trip_count,
            has_nested_loops: false,
            has_function_calls: false,
            patterns: Vec::new(),
            loops_index,
        });

        for s in &f.body {
            self.walk_stmt(s);
        }

        self.exit_for();
    }

    fn exit_for(&mut self) {
        let ctx = match self.loop_stack.pop() {
            Some(ctx) => ctx,
            None => return,
        };

        if let Some(consolidated) = consolidate_loop(&ctx) {
            self.result.patterns.push(consolidated);
        }

        let info = &mut self.result.loops[ctx.loops_index];
        info.has_nested_loops = ctx.has_nested_loops;
        info.has_function_calls = ctx.has_function_calls;
        info.patterns = ctx.patterns;
    }

    fn walk_expr(&mut self, e: &Expr) {
        match &e.kind {
            ExprKind::Subscript { .. } => self.handle_subscript(e),
            ExprKind::Member { .. } => self.handle_member(e),
            ExprKind::Unary { operand, .. } => self.walk_expr(operand),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.walk_expr(lhs);
                self.walk_expr(rhs);
            }
            ExprKind::Call { args, .. } => {
                if let Some(innermost) = self.loop_stack.last_mut() {
                    innermost.has_function_calls = true;
                }
                for arg in args {
                    self.walk_expr(arg);
                }
            }
            ExprKind::DeclRef { .. } | ExprKind::IntLiteral(_) => {}
        }
    }

    /// Classifies a whole subscript chain (`A[e]`, `A[i][j]`, ...) as one
    /// access site, then recurses into the index expressions so indirect
    /// index loads (`B[g]` inside `A[B[g]]`) get their own record.
    fn handle_subscript(&mut self, e: &Expr) {
        let (root, indices) = flatten_subscript_chain(e);
        if self.loop_stack.is_empty() {
            for index in &indices {
                self.walk_expr(index);
            }
            return;
        }

        let (array_name, is_pointer_access) = base_name(root);
        let pattern = self.classify_chain(e, &indices, array_name, is_pointer_access);
        self.record_pattern(pattern);

        for index in &indices {
            self.walk_expr(index);
        }
    }

    fn classify_chain(
        &mut self,
        site: &Expr,
        indices: &[&Expr],
        array_name: String,
        is_pointer_access: bool,
    ) -> StaticPattern {
        // Column-major shape: outer subscript driven by the innermost
        // induction variable, inner subscript by an outer one.
        if indices.len() >= 2 && self.loop_stack.len() >= 2 {
            let innermost_var = &self.loop_stack[self.loop_stack.len() - 1].loop_var;
            let outer_idx = indices[0].as_decl_ref();
            let inner_idx = indices[indices.len() - 1].as_decl_ref();
            let inner_is_outer_var = inner_idx.is_some_and(|name| {
                self.loop_stack[..self.loop_stack.len() - 1]
                    .iter()
                    .any(|lc| lc.loop_var == name)
            });
            if outer_idx == Some(innermost_var.as_str()) && inner_is_outer_var {
                let outer_stride = self.nested_outer_stride;
                return self.make_pattern(
                    site,
                    array_name,
                    indices.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", "),
                    AccessPatternKind::NestedLoop { outer_stride },
                    outer_stride,
                    is_pointer_access,
                    false,
                    false,
                );
            }
        }

        // Otherwise the fastest-varying (last) subscript decides.
        let index = indices[indices.len() - 1];
        let classified = self.classify_index(index);
        self.make_pattern(
            site,
            array_name,
            classified.index_var,
            classified.kind,
            classified.stride,
            is_pointer_access,
            classified.is_indirect,
            classified.has_dependencies,
        )
    }

    fn classify_index(&mut self, e: &Expr) -> ClassifiedIndex {
        let text = e.to_string();
        match &e.kind {
            ExprKind::DeclRef { name, .. } => {
                if let Some(lc) = self.find_loop_for(name) {
                    match lc.stride {
                        Some(1) => ClassifiedIndex::new(AccessPatternKind::Sequential, 1, text),
                        Some(s) => {
                            ClassifiedIndex::new(AccessPatternKind::Strided { stride: s }, s, text)
                        }
                        None => {
                            ClassifiedIndex::new(AccessPatternKind::Strided { stride: 0 }, 0, text)
                        }
                    }
                } else {
                    ClassifiedIndex::new(AccessPatternKind::Random, 0, text)
                }
            }
            ExprKind::IntLiteral(_) => {
                ClassifiedIndex::new(AccessPatternKind::Sequential, 0, text)
            }
            ExprKind::Binary { op, lhs, rhs } => self.classify_index_binary(*op, lhs, rhs, text),
            ExprKind::Subscript { .. } => {
                ClassifiedIndex::new(AccessPatternKind::Indirect, 0, text).indirect()
            }
            ExprKind::Unary { op: UnaryOp::Deref, .. } => {
                ClassifiedIndex::new(AccessPatternKind::Indirect, 0, text).indirect()
            }
            ExprKind::Call { callee, .. } => {
                let var = if callee == "rand" || callee == "random" {
                    "rand()".to_string()
                } else {
                    text
                };
                ClassifiedIndex::new(AccessPatternKind::Random, 0, var)
            }
            _ => ClassifiedIndex::new(AccessPatternKind::Random, 0, text),
        }
    }

    fn classify_index_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        text: String,
    ) -> ClassifiedIndex {
        // Normalize to (induction var, literal) regardless of operand order
        // for the commutative shapes.
        let var_lit = match (lhs.as_decl_ref(), rhs.as_int_literal()) {
            (Some(name), Some(lit)) if self.find_loop_for(name).is_some() => Some((lit, false)),
            _ => match (lhs.as_int_literal(), rhs.as_decl_ref()) {
                (Some(lit), Some(name)) if self.find_loop_for(name).is_some() => {
                    Some((lit, true))
                }
                _ => None,
            },
        };

        let (lit, reversed) = match var_lit {
            Some(v) => v,
            None => return ClassifiedIndex::new(AccessPatternKind::Random, 0, text),
        };

        match op {
            BinaryOp::Add | BinaryOp::Sub if !reversed || op == BinaryOp::Add => {
                let offset = if op == BinaryOp::Sub { -lit } else { lit };
                if offset == -1 {
                    ClassifiedIndex::new(AccessPatternKind::LoopCarriedDep, -1, text).dependent()
                } else if offset.abs() > 1 {
                    ClassifiedIndex::new(
                        AccessPatternKind::Strided { stride: offset.abs() },
                        offset.abs(),
                        text,
                    )
                } else {
                    ClassifiedIndex::new(AccessPatternKind::Sequential, 1, text)
                }
            }
            BinaryOp::Mul => {
                ClassifiedIndex::new(AccessPatternKind::Strided { stride: lit }, lit, text)
            }
            BinaryOp::Div if !reversed => {
                ClassifiedIndex::new(AccessPatternKind::GatherScatter, 0, text)
            }
            BinaryOp::Rem if !reversed => {
                // Wrap-around: the modulus is kept as the recorded stride.
                ClassifiedIndex::new(AccessPatternKind::Strided { stride: lit }, lit, text)
            }
            BinaryOp::Shl if !reversed => {
                let stride = 1i64.checked_shl(lit.max(0) as u32).unwrap_or(i64::MAX);
                ClassifiedIndex::new(AccessPatternKind::Strided { stride }, stride, text)
            }
            BinaryOp::Shr if !reversed => {
                ClassifiedIndex::new(AccessPatternKind::GatherScatter, 0, text)
            }
            _ => ClassifiedIndex::new(AccessPatternKind::Random, 0, text),
        }
    }

    fn handle_member(&mut self, e: &Expr) {
        let (base, field, is_arrow) = match &e.kind {
            ExprKind::Member { base, field, is_arrow } => (base, field, is_arrow),
            _ => return,
        };
        if self.loop_stack.is_empty() {
            self.walk_expr(base);
            return;
        }

        let (base_text, base_is_pointer) = base_name(base);
        let mut pattern = self.make_pattern(
            e,
            base_text,
            field.clone(),
            AccessPatternKind::GatherScatter,
            0,
            *is_arrow || base_is_pointer,
            false,
            false,
        );
        pattern.is_struct_access = true;
        self.record_pattern(pattern);

        // A subscripted base (points[i].x) still counts as an array access.
        if matches!(base.kind, ExprKind::Subscript { .. }) {
            self.walk_expr(base);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn make_pattern(
        &self,
        site: &Expr,
        array_name: String,
        index_var: String,
        kind: AccessPatternKind,
        stride: i64,
        is_pointer_access: bool,
        is_indirect_index: bool,
        has_dependencies: bool,
    ) -> StaticPattern {
        let innermost = self.loop_stack.last();
        let trip = innermost
            .and_then(|lc| lc.trip_count)
            .unwrap_or(1024);
        let factor = match kind {
            AccessPatternKind::Strided { stride } => stride.unsigned_abs().max(1),
            AccessPatternKind::NestedLoop { outer_stride } => outer_stride.unsigned_abs().max(1),
            _ => 1,
        };
        let location = if site.location.file.is_empty() {
            innermost
                .map(|lc| lc.location.clone())
                .unwrap_or_else(|| site.location.clone())
        } else {
            site.location.clone()
        };

        StaticPattern {
            location,
            array_name,
            index_var,
            loop_depth: self.loop_stack.len() as u32,
            kind,
            stride,
            is_pointer_access,
            is_struct_access: false,
            is_indirect_index,
            has_dependencies,
            estimated_footprint_bytes: trip.saturating_mul(self.element_size).saturating_mul(factor),
        }
    }

    fn record_pattern(&mut self, pattern: StaticPattern) {
        if let Some(innermost) = self.loop_stack.last_mut() {
            innermost.patterns.push(pattern.clone());
        }
        self.result.patterns.push(pattern);
    }

    fn find_loop_for(&self, var: &str) -> Option<&LoopContext> {
        self.loop_stack.iter().rev().find(|lc| lc.loop_var == var)
    }

    fn collect_structs(&mut self, tu: &TranslationUnit) {
        for record in &tu.records {
            if record.location.file != tu.main_file {
                continue;
            }
            let mut fields = ArrayVec::new();
            for field in record.fields.iter().take(MAX_STRUCT_FIELDS) {
                fields.push(FieldInfo {
                    name: field.name.clone(),
                    offset_bytes: field.offset_bytes,
                    size_bytes: field.size_bytes,
                });
            }
            if record.fields.len() > MAX_STRUCT_FIELDS {
                self.result.diagnostics.push(format!(
                    "struct {} has {} fields; keeping the first {}",
                    record.name,
                    record.fields.len(),
                    MAX_STRUCT_FIELDS
                ));
            }
            self.result.structs.push(StructInfo {
                name: record.name.clone(),
                location: record.location.clone(),
                fields,
                total_size_bytes: record.total_size_bytes,
                has_pointer_fields: record.fields.iter().any(|f| f.is_pointer),
                is_packed: record.is_packed,
            });
        }
    }
}

struct ClassifiedIndex {
    kind: AccessPatternKind,
    stride: i64,
    index_var: String,
    is_indirect: bool,
    has_dependencies: bool,
}

impl ClassifiedIndex {
    fn new(kind: AccessPatternKind, stride: i64, index_var: String) -> Self {
        Self {
            kind,
            stride,
            index_var,
            is_indirect: false,
            has_dependencies: false,
        }
    }

    fn indirect(mut self) -> Self {
        self.is_indirect = true;
        self
    }

    fn dependent(mut self) -> Self {
        self.has_dependencies = true;
        self
    }
}

/// Walks `A[i][j][k]` down to the base declaration; returns the base
/// expression and the index expressions in source order (outermost first).
fn flatten_subscript_chain(e: &Expr) -> (&Expr, Vec<&Expr>) {
    let mut indices = Vec::new();
    let mut current = e;
    loop {
        match &current.kind {
            ExprKind::Subscript { base, index } => {
                indices.push(index.as_ref());
                current = base;
            }
            _ => break,
        }
    }
    indices.reverse();
    (current, indices)
}

fn base_name(root: &Expr) -> (String, bool) {
    match &root.kind {
        ExprKind::DeclRef { name, is_pointer } => (name.clone(), *is_pointer),
        ExprKind::Member { is_arrow, .. } => (root.to_string(), *is_arrow),
        ExprKind::Unary { op: UnaryOp::Deref, .. } => (root.to_string(), true),
        _ => (root.to_string(), false),
    }
}

/// Stride of the induction variable per loop iteration, from the increment
/// clause. None when the update shape is not recognized.
fn derive_stride(inc: &Expr, loop_var: &str) -> Option<i64> {
    match &inc.kind {
        ExprKind::Unary { op, operand } if operand.as_decl_ref() == Some(loop_var) => match op {
            UnaryOp::PreInc | UnaryOp::PostInc => Some(1),
            UnaryOp::PreDec | UnaryOp::PostDec => Some(-1),
            _ => None,
        },
        ExprKind::Binary { op, lhs, rhs } if lhs.as_decl_ref() == Some(loop_var) => match op {
            BinaryOp::AddAssign => rhs.as_int_literal(),
            BinaryOp::SubAssign => rhs.as_int_literal().map(|k| -k),
            BinaryOp::Assign => match &rhs.kind {
                // i = i + k and i = k + i; i = i - k.
                ExprKind::Binary { op: inner_op, lhs: a, rhs: b } => {
                    let k = if a.as_decl_ref() == Some(loop_var) {
                        b.as_int_literal()
                    } else if b.as_decl_ref() == Some(loop_var) && *inner_op == BinaryOp::Add {
                        a.as_int_literal()
                    } else {
                        None
                    }?;
                    match inner_op {
                        BinaryOp::Add => Some(k),
                        BinaryOp::Sub => Some(-k),
                        _ => None,
                    }
                }
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

fn estimate_trip_count(
    init: &Option<VarDecl>,
    condition: &Option<Expr>,
    stride: Option<i64>,
) -> Option<u64> {
    let init = init.as_ref()?;
    let start = init.init.as_ref()?.as_int_literal()?;
    let stride = stride?;
    let (op, lhs, rhs) = match &condition.as_ref()?.kind {
        ExprKind::Binary { op, lhs, rhs } => (*op, lhs, rhs),
        _ => return None,
    };
    if lhs.as_decl_ref() != Some(init.name.as_str()) {
        return None;
    }
    let bound = rhs.as_int_literal()?;

    let span = match op {
        BinaryOp::Lt if stride > 0 => bound - start,
        BinaryOp::Le if stride > 0 => bound - start + 1,
        BinaryOp::Gt if stride < 0 => start - bound,
        BinaryOp::Ge if stride < 0 => start - bound + 1,
        _ => return None,
    };
    if span <= 0 {
        return Some(0);
    }
    let step = stride.unsigned_abs();
    Some((span as u64).div_ceil(step))
}

/// Dominant pattern for a finished loop: a large stride wins, then
/// sequential, then whatever came first.
fn consolidate_loop(ctx: &LoopContext) -> Option<StaticPattern> {
    if ctx.patterns.is_empty() {
        return None;
    }

    let strided_max = ctx
        .patterns
        .iter()
        .filter(|p| matches!(p.kind, AccessPatternKind::Strided { stride } if stride > 8))
        .max_by_key(|p| p.stride);

    let source = if let Some(p) = strided_max {
        p
    } else if let Some(p) = ctx
        .patterns
        .iter()
        .find(|p| p.kind == AccessPatternKind::Sequential)
    {
        p
    } else {
        &ctx.patterns[0]
    };

    let footprint: u64 = ctx
        .patterns
        .iter()
        .map(|p| p.estimated_footprint_bytes)
        .sum();

    Some(StaticPattern {
        location: ctx.location.clone(),
        array_name: source.array_name.clone(),
        index_var: ctx.loop_var.clone(),
        loop_depth: ctx.depth,
        kind: source.kind,
        stride: source.stride,
        is_pointer_access: source.is_pointer_access,
        is_struct_access: false,
        is_indirect_index: false,
        has_dependencies: ctx.patterns.iter().any(|p| p.has_dependencies),
        estimated_footprint_bytes: footprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FieldLayout, RecordDecl};

    fn loc(line: u32) -> SourceLocation {
        SourceLocation::new("main.c", line).with_function("kernel")
    }

    /// `for (var = 0; var < limit; var += step) { body }`
    fn counted_loop(line: u32, var: &str, limit: i64, step: i64, body: Vec<Stmt>) -> Stmt {
        let increment = if step == 1 {
            Expr::unary(UnaryOp::PostInc, Expr::decl_ref(var))
        } else {
            Expr::binary(BinaryOp::AddAssign, Expr::decl_ref(var), Expr::int(step))
        };
        Stmt::For(ForStmt {
            location: loc(line),
            init: Some(VarDecl {
                location: loc(line),
                name: var.to_string(),
                init: Some(Expr::int(0)),
            }),
            condition: Some(Expr::binary(
                BinaryOp::Lt,
                Expr::decl_ref(var),
                Expr::int(limit),
            )),
            increment: Some(increment),
            body,
        })
    }

    fn access(array: &str, index: Expr) -> Stmt {
        Stmt::Expr(Expr::subscript(Expr::decl_ref(array), index).at(loc(10)))
    }

    fn extract(stmts: Vec<Stmt>) -> ExtractionResult {
        let ctx = Context::with_defaults();
        let tu = TranslationUnit::new("main.c").with_stmts(stmts);
        PatternExtractor::new(&ctx).extract(&tu).unwrap()
    }

    fn site_patterns(result: &ExtractionResult) -> Vec<&StaticPattern> {
        // Consolidated records carry the loop variable as index_var and the
        // loop's own location; filter to line 10 access sites.
        result.patterns.iter().filter(|p| p.location.line == 10).collect()
    }

    #[test]
    fn test_sequential_access() {
        let result = extract(vec![counted_loop(
            1,
            "i",
            1024,
            1,
            vec![access("a", Expr::decl_ref("i"))],
        )]);
        let sites = site_patterns(&result);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].kind, AccessPatternKind::Sequential);
        assert_eq!(sites[0].stride, 1);
        assert_eq!(sites[0].array_name, "a");
        assert_eq!(sites[0].index_var, "i");
        assert_eq!(sites[0].loop_depth, 1);
    }

    #[test]
    fn test_loop_stride_propagates_to_plain_index() {
        let result = extract(vec![counted_loop(
            1,
            "i",
            1024,
            4,
            vec![access("a", Expr::decl_ref("i"))],
        )]);
        let sites = site_patterns(&result);
        assert_eq!(sites[0].kind, AccessPatternKind::Strided { stride: 4 });
    }

    #[test]
    fn test_offset_classification() {
        // a[i + 3] -> strided(3); a[i + 1] -> sequential; a[i - 1] -> loop-carried.
        let result = extract(vec![counted_loop(
            1,
            "i",
            100,
            1,
            vec![
                access(
                    "a",
                    Expr::binary(BinaryOp::Add, Expr::decl_ref("i"), Expr::int(3)),
                ),
                access(
                    "b",
                    Expr::binary(BinaryOp::Add, Expr::decl_ref("i"), Expr::int(1)),
                ),
                access(
                    "c",
                    Expr::binary(BinaryOp::Sub, Expr::decl_ref("i"), Expr::int(1)),
                ),
            ],
        )]);
        let sites = site_patterns(&result);
        assert_eq!(sites[0].kind, AccessPatternKind::Strided { stride: 3 });
        assert_eq!(sites[1].kind, AccessPatternKind::Sequential);
        assert_eq!(sites[2].kind, AccessPatternKind::LoopCarriedDep);
        assert_eq!(sites[2].stride, -1);
        assert!(sites[2].has_dependencies);
    }

    #[test]
    fn test_scaled_and_wrapped_indices() {
        let result = extract(vec![counted_loop(
            1,
            "i",
            100,
            1,
            vec![
                access(
                    "a",
                    Expr::binary(BinaryOp::Mul, Expr::decl_ref("i"), Expr::int(16)),
                ),
                access(
                    "b",
                    Expr::binary(BinaryOp::Mul, Expr::int(8), Expr::decl_ref("i")),
                ),
                access(
                    "c",
                    Expr::binary(BinaryOp::Div, Expr::decl_ref("i"), Expr::int(4)),
                ),
                access(
                    "d",
                    Expr::binary(BinaryOp::Rem, Expr::decl_ref("i"), Expr::int(64)),
                ),
                access(
                    "e",
                    Expr::binary(BinaryOp::Shl, Expr::decl_ref("i"), Expr::int(3)),
                ),
                access(
                    "f",
                    Expr::binary(BinaryOp::Shr, Expr::decl_ref("i"), Expr::int(2)),
                ),
            ],
        )]);
        let sites = site_patterns(&result);
        assert_eq!(sites[0].kind, AccessPatternKind::Strided { stride: 16 });
        assert_eq!(sites[1].kind, AccessPatternKind::Strided { stride: 8 });
        assert_eq!(sites[2].kind, AccessPatternKind::GatherScatter);
        // Modulus kept as the recorded stride (wrap-around semantics).
        assert_eq!(sites[3].kind, AccessPatternKind::Strided { stride: 64 });
        assert_eq!(sites[4].kind, AccessPatternKind::Strided { stride: 8 });
        assert_eq!(sites[5].kind, AccessPatternKind::GatherScatter);
    }

    #[test]
    fn test_indirect_and_random_indices() {
        let result = extract(vec![counted_loop(
            1,
            "i",
            100,
            1,
            vec![
                access(
                    "a",
                    Expr::subscript(Expr::decl_ref("perm"), Expr::decl_ref("i")).at(loc(10)),
                ),
                access("b", Expr::unary(UnaryOp::Deref, Expr::pointer_ref("p"))),
                access("c", Expr::call("rand", vec![])),
                access("d", Expr::int(5)),
                access("e", Expr::decl_ref("unrelated")),
            ],
        )]);
        let sites = site_patterns(&result);

        assert_eq!(sites[0].kind, AccessPatternKind::Indirect);
        assert!(sites[0].is_indirect_index);
        // The inner perm[i] load is recorded too.
        assert_eq!(sites[1].array_name, "perm");
        assert_eq!(sites[1].kind, AccessPatternKind::Sequential);

        assert_eq!(sites[2].kind, AccessPatternKind::Indirect);
        assert_eq!(sites[3].kind, AccessPatternKind::Random);
        assert_eq!(sites[3].index_var, "rand()");
        assert_eq!(sites[4].kind, AccessPatternKind::Sequential);
        assert_eq!(sites[4].stride, 0);
        assert_eq!(sites[5].kind, AccessPatternKind::Random);
    }

    #[test]
    fn test_column_major_nested_loop() {
        // for (j..) for (i..) M[i][j]: outer subscript uses the innermost var.
        let chain = Stmt::Expr(
            Expr::subscript(
                Expr::subscript(Expr::decl_ref("M"), Expr::decl_ref("i")),
                Expr::decl_ref("j"),
            )
            .at(loc(10)),
        );
        let result = extract(vec![counted_loop(
            1,
            "j",
            1024,
            1,
            vec![counted_loop(2, "i", 1024, 1, vec![chain])],
        )]);
        let sites = site_patterns(&result);
        assert_eq!(sites.len(), 1);
        assert_eq!(
            sites[0].kind,
            AccessPatternKind::NestedLoop { outer_stride: 1024 }
        );
        assert_eq!(sites[0].loop_depth, 2);
        assert_eq!(sites[0].array_name, "M");
    }

    #[test]
    fn test_row_major_nested_loop_is_sequential() {
        let chain = Stmt::Expr(
            Expr::subscript(
                Expr::subscript(Expr::decl_ref("M"), Expr::decl_ref("i")),
                Expr::decl_ref("j"),
            )
            .at(loc(10)),
        );
        let result = extract(vec![counted_loop(
            1,
            "i",
            1024,
            1,
            vec![counted_loop(2, "j", 1024, 1, vec![chain])],
        )]);
        let sites = site_patterns(&result);
        assert_eq!(sites[0].kind, AccessPatternKind::Sequential);
    }

    #[test]
    fn test_struct_member_access() {
        let member = Stmt::Expr(Expr::arrow(Expr::pointer_ref("node"), "weight").at(loc(10)));
        let result = extract(vec![counted_loop(1, "i", 100, 1, vec![member])]);
        let sites = site_patterns(&result);
        assert_eq!(sites.len(), 1);
        assert!(sites[0].is_struct_access);
        assert!(sites[0].is_pointer_access);
        assert_eq!(sites[0].kind, AccessPatternKind::GatherScatter);
        assert_eq!(sites[0].index_var, "weight");
    }

    #[test]
    fn test_loop_info_and_trip_count() {
        let result = extract(vec![counted_loop(
            1,
            "i",
            1000,
            2,
            vec![access("a", Expr::decl_ref("i"))],
        )]);
        assert_eq!(result.loops.len(), 1);
        let info = &result.loops[0];
        assert_eq!(info.loop_var, "i");
        assert_eq!(info.condition_text, "i < 1000");
        assert_eq!(info.increment_text, "i += 2");
        assert_eq!(info.estimated_trip_count, Some(500));
        assert_eq!(info.nest_level, 1);
        assert!(!info.has_nested_loops);
        assert_eq!(info.patterns.len(), 1);
    }

    #[test]
    fn test_while_marks_nesting_without_context() {
        let inner = Stmt::While(crate::ast::WhileStmt {
            location: loc(5),
            body: vec![access("a", Expr::decl_ref("i"))],
        });
        let result = extract(vec![counted_loop(1, "i", 100, 1, vec![inner])]);
        assert_eq!(result.loops.len(), 1);
        assert!(result.loops[0].has_nested_loops);
        // The access is attributed to the enclosing for loop.
        assert_eq!(result.loops[0].patterns.len(), 1);
    }

    #[test]
    fn test_function_call_detection() {
        let call = Stmt::Expr(Expr::call("process", vec![Expr::decl_ref("i")]).at(loc(10)));
        let result = extract(vec![counted_loop(1, "i", 100, 1, vec![call])]);
        assert!(result.loops[0].has_function_calls);
    }

    #[test]
    fn test_unknown_stride_reports_diagnostic() {
        let stmt = Stmt::For(ForStmt {
            location: loc(1),
            init: Some(VarDecl {
                location: loc(1),
                name: "i".to_string(),
                init: Some(Expr::int(1)),
            }),
            condition: Some(Expr::binary(
                BinaryOp::Lt,
                Expr::decl_ref("i"),
                Expr::int(4096),
            )),
            increment: Some(Expr::binary(
                BinaryOp::MulAssign,
                Expr::decl_ref("i"),
                Expr::int(2),
            )),
            body: vec![access("a", Expr::decl_ref("i"))],
        });
        let result = extract(vec![stmt]);
        assert!(result.diagnostics.iter().any(|d| d.contains("unknown induction stride")));
        let sites = site_patterns(&result);
        assert_eq!(sites[0].kind, AccessPatternKind::Strided { stride: 0 });
        assert_eq!(result.loops[0].estimated_trip_count, None);
    }

    #[test]
    fn test_countdown_loop_stride() {
        let stmt = Stmt::For(ForStmt {
            location: loc(1),
            init: Some(VarDecl {
                location: loc(1),
                name: "i".to_string(),
                init: Some(Expr::int(99)),
            }),
            condition: Some(Expr::binary(
                BinaryOp::Ge,
                Expr::decl_ref("i"),
                Expr::int(0),
            )),
            increment: Some(Expr::unary(UnaryOp::PostDec, Expr::decl_ref("i"))),
            body: vec![access("a", Expr::decl_ref("i"))],
        });
        let result = extract(vec![stmt]);
        assert_eq!(result.loops[0].estimated_trip_count, Some(100));
        let sites = site_patterns(&result);
        assert_eq!(sites[0].kind, AccessPatternKind::Strided { stride: -1 });
    }

    #[test]
    fn test_consolidation_prefers_large_stride() {
        let result = extract(vec![counted_loop(
            1,
            "i",
            100,
            1,
            vec![
                access("a", Expr::decl_ref("i")),
                access(
                    "b",
                    Expr::binary(BinaryOp::Mul, Expr::decl_ref("i"), Expr::int(32)),
                ),
            ],
        )]);
        let consolidated: Vec<_> = result
            .patterns
            .iter()
            .filter(|p| p.location.line == 1)
            .collect();
        assert_eq!(consolidated.len(), 1);
        assert_eq!(consolidated[0].kind, AccessPatternKind::Strided { stride: 32 });
        assert_eq!(consolidated[0].index_var, "i");
        assert_eq!(consolidated[0].array_name, "b");
    }

    #[test]
    fn test_consolidation_falls_back_to_sequential() {
        let result = extract(vec![counted_loop(
            1,
            "i",
            100,
            1,
            vec![
                access("a", Expr::call("rand", vec![])),
                access("b", Expr::decl_ref("i")),
            ],
        )]);
        let consolidated: Vec<_> = result
            .patterns
            .iter()
            .filter(|p| p.location.line == 1)
            .collect();
        assert_eq!(consolidated[0].kind, AccessPatternKind::Sequential);
    }

    #[test]
    fn test_header_loops_skipped() {
        let mut header_loop = counted_loop(1, "i", 100, 1, vec![access("a", Expr::decl_ref("i"))]);
        if let Stmt::For(f) = &mut header_loop {
            f.location.file = "vector.h".to_string();
        }
        let result = extract(vec![header_loop]);
        assert!(result.loops.is_empty());
        assert!(result.patterns.is_empty());
    }

    #[test]
    fn test_fatal_diagnostic_fails_unit() {
        let ctx = Context::with_defaults();
        let mut tu = TranslationUnit::new("broken.c");
        tu.fatal_diagnostic = Some("broken.c:3: unknown type name 'flaot'".to_string());
        let err = PatternExtractor::new(&ctx).extract(&tu).unwrap_err();
        assert!(matches!(err, AnalysisError::ExtractorFailed { .. }));
    }

    #[test]
    fn test_struct_collection_and_truncation() {
        let ctx = Context::with_defaults();
        let wide_fields: Vec<FieldLayout> = (0..40)
            .map(|i| FieldLayout {
                name: format!("f{}", i),
                offset_bytes: i * 8,
                size_bytes: 8,
                is_pointer: i == 0,
            })
            .collect();
        let tu = TranslationUnit::new("main.c").with_records(vec![
            RecordDecl {
                name: "Wide".to_string(),
                location: loc(1),
                fields: wide_fields,
                total_size_bytes: 320,
                is_packed: false,
            },
            RecordDecl {
                name: "Hidden".to_string(),
                location: SourceLocation::new("types.h", 9),
                fields: vec![],
                total_size_bytes: 4,
                is_packed: true,
            },
        ]);
        let result = PatternExtractor::new(&ctx).extract(&tu).unwrap();
        assert_eq!(result.structs.len(), 1);
        let info = &result.structs[0];
        assert_eq!(info.fields.len(), MAX_STRUCT_FIELDS);
        assert!(info.has_pointer_fields);
        assert!(result.diagnostics.iter().any(|d| d.contains("Wide")));
    }

    #[test]
    fn test_nested_loops_ordered_outer_first() {
        let chain = Stmt::Expr(
            Expr::subscript(
                Expr::subscript(Expr::decl_ref("M"), Expr::decl_ref("i")),
                Expr::decl_ref("j"),
            )
            .at(loc(10)),
        );
        let result = extract(vec![counted_loop(
            1,
            "i",
            64,
            1,
            vec![counted_loop(2, "j", 64, 1, vec![chain])],
        )]);
        assert_eq!(result.loops.len(), 2);
        assert_eq!(result.loops[0].loop_var, "i");
        assert_eq!(result.loops[0].nest_level, 1);
        assert!(result.loops[0].has_nested_loops);
        assert_eq!(result.loops[1].loop_var, "j");
        assert_eq!(result.loops[1].nest_level, 2);
    }
}
