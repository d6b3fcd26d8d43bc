// emitter.rs — Function emitter: loop-nest kernel builder, printer and interpreter
//
// Nodes emit code through a `FunctionEmitter`: buffer declarations, bounded
// sequential loops, parallel loops with explicit captures, pointer offsets,
// loads, stores, elementwise arithmetic and strided dot products. The result is
// a `Kernel`, which prints as C source and runs through a reference
// interpreter so compiled maps can be checked against interpreted compute.
//
// Index arithmetic is folded while building (`i * 1 + 0` prints as `i`), so the
// printed kernel stays readable and snapshot-stable.

use std::fmt;
use std::ops::{Add, Mul};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::layout::{PortMemoryLayout, PortType};
use crate::value::PortValue;

// ── Handles ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopVar(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum BufferKind {
    /// Caller-provided input, in declaration order.
    Argument,
    /// Caller-visible output.
    Result,
    /// Read-only data baked into the kernel.
    Constant(Vec<f64>),
    /// Scratch buffer, zeroed on entry.
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub name: String,
    pub kind: BufferKind,
    pub port_type: PortType,
    pub len: usize,
}

// ── Expressions and statements ─────────────────────────────────────────────

/// Coordinatewise operation shared by nodes and emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::LogicalAnd => "&&",
            BinaryOp::LogicalOr => "||",
            BinaryOp::LogicalXor => "!=",
        }
    }

    pub fn is_logical(self) -> bool {
        matches!(
            self,
            BinaryOp::LogicalAnd | BinaryOp::LogicalOr | BinaryOp::LogicalXor
        )
    }

    pub fn apply(self, a: f64, b: f64) -> f64 {
        let truth = |v: bool| if v { 1.0 } else { 0.0 };
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Subtract => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => a / b,
            BinaryOp::LogicalAnd => truth(a != 0.0 && b != 0.0),
            BinaryOp::LogicalOr => truth(a != 0.0 || b != 0.0),
            BinaryOp::LogicalXor => truth((a != 0.0) != (b != 0.0)),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinaryOp::Add => "add",
            BinaryOp::Subtract => "subtract",
            BinaryOp::Multiply => "multiply",
            BinaryOp::Divide => "divide",
            BinaryOp::LogicalAnd => "logical_and",
            BinaryOp::LogicalOr => "logical_or",
            BinaryOp::LogicalXor => "logical_xor",
        };
        f.write_str(name)
    }
}

/// Element address: a buffer plus a flat offset expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Pointer {
    pub buffer: BufferId,
    pub offset: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    Index(LoopVar),
    Load(Box<Pointer>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `sum(lhs[i * lhs_stride] * rhs[i * rhs_stride])` for i in 0..count.
    Dot {
        lhs: Box<Pointer>,
        lhs_stride: usize,
        rhs: Box<Pointer>,
        rhs_stride: usize,
        count: usize,
    },
    Cast {
        to: PortType,
        value: Box<Expr>,
    },
}

impl Expr {
    pub fn index(n: usize) -> Expr {
        Expr::Literal(n as f64)
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        if let (Expr::Literal(a), Expr::Literal(b)) = (&lhs, &rhs) {
            return Expr::Literal(op.apply(*a, *b));
        }
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn as_literal(&self) -> Option<f64> {
        match self {
            Expr::Literal(v) => Some(*v),
            _ => None,
        }
    }
}

/// Index addition with folding of zero and literal operands.
impl Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        match (self.as_literal(), rhs.as_literal()) {
            (Some(a), _) if a == 0.0 => rhs,
            (_, Some(b)) if b == 0.0 => self,
            _ => Expr::binary(BinaryOp::Add, self, rhs),
        }
    }
}

/// Index multiplication with folding of zero, one and literal operands.
impl Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        match (self.as_literal(), rhs.as_literal()) {
            (Some(a), _) if a == 0.0 => Expr::Literal(0.0),
            (_, Some(b)) if b == 0.0 => Expr::Literal(0.0),
            (Some(a), _) if a == 1.0 => rhs,
            (_, Some(b)) if b == 1.0 => self,
            _ => Expr::binary(BinaryOp::Multiply, self, rhs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Loop {
        var: LoopVar,
        count: usize,
        parallel: bool,
        captured: Vec<BufferId>,
        body: Vec<Stmt>,
    },
    Store {
        ptr: Pointer,
        value: Expr,
    },
}

// ── Kernel ─────────────────────────────────────────────────────────────────

/// A finished function: buffers plus a statement list.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    name: String,
    buffers: Vec<Buffer>,
    body: Vec<Stmt>,
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn body(&self) -> &[Stmt] {
        &self.body
    }

    pub fn arguments(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers
            .iter()
            .filter(|b| b.kind == BufferKind::Argument)
    }

    pub fn result(&self) -> Option<&Buffer> {
        self.buffers.iter().find(|b| b.kind == BufferKind::Result)
    }

    /// Number of local scratch buffers.
    pub fn local_count(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.kind == BufferKind::Local)
            .count()
    }

    /// Run the kernel on one value per argument and return the result buffer.
    ///
    /// Parallel loops run sequentially; iterations are independent by
    /// construction, so the result is the same.
    pub fn execute(&self, args: &[PortValue]) -> Result<PortValue> {
        let expected: Vec<&Buffer> = self.arguments().collect();
        if args.len() != expected.len() {
            return Err(GraphError::InvalidArgument(format!(
                "{} expects {} input buffers, got {}",
                self.name,
                expected.len(),
                args.len()
            )));
        }
        for (arg, buf) in args.iter().zip(&expected) {
            if arg.port_type() != buf.port_type || arg.len() != buf.len {
                return Err(GraphError::InvalidArgument(format!(
                    "input '{}' expects {} {} elements, got {} {} elements",
                    buf.name,
                    buf.len,
                    buf.port_type,
                    arg.len(),
                    arg.port_type()
                )));
            }
        }

        let mut args = args.iter();
        let mut memory: Vec<Vec<f64>> = Vec::with_capacity(self.buffers.len());
        for buf in &self.buffers {
            let data = match &buf.kind {
                BufferKind::Argument => args
                    .next()
                    .map(PortValue::to_f64_vec)
                    .unwrap_or_default(),
                BufferKind::Constant(values) => values.clone(),
                BufferKind::Result | BufferKind::Local => vec![0.0; buf.len],
            };
            memory.push(data);
        }

        let mut interp = Interpreter {
            buffers: &self.buffers,
            memory,
            vars: Vec::new(),
        };
        interp.run(&self.body)?;

        let (index, result) = self
            .buffers
            .iter()
            .enumerate()
            .find(|(_, b)| b.kind == BufferKind::Result)
            .ok_or_else(|| GraphError::Execution(format!("{} has no result buffer", self.name)))?;
        Ok(PortValue::from_f64(result.port_type, &interp.memory[index]))
    }
}

struct Interpreter<'k> {
    buffers: &'k [Buffer],
    memory: Vec<Vec<f64>>,
    vars: Vec<usize>,
}

impl Interpreter<'_> {
    fn run(&mut self, stmts: &[Stmt]) -> Result<()> {
        for stmt in stmts {
            match stmt {
                Stmt::Loop {
                    var, count, body, ..
                } => {
                    if self.vars.len() <= var.0 {
                        self.vars.resize(var.0 + 1, 0);
                    }
                    for i in 0..*count {
                        self.vars[var.0] = i;
                        self.run(body)?;
                    }
                }
                Stmt::Store { ptr, value } => {
                    let v = self.eval(value)?;
                    let (b, at) = self.address(ptr, 0)?;
                    let ty = self.buffers[b].port_type;
                    if matches!(self.buffers[b].kind, BufferKind::Argument | BufferKind::Constant(_)) {
                        return Err(GraphError::Execution(format!(
                            "store into read-only buffer {}",
                            self.buffers[b].name
                        )));
                    }
                    self.memory[b][at] = ty.quantize(v);
                }
            }
        }
        Ok(())
    }

    fn address(&self, ptr: &Pointer, extra: usize) -> Result<(usize, usize)> {
        let b = ptr.buffer.0;
        let len = self
            .memory
            .get(b)
            .map(Vec::len)
            .ok_or_else(|| GraphError::Execution(format!("unknown buffer {}", b)))?;
        let offset = self.eval(&ptr.offset)?;
        if offset < 0.0 {
            return Err(GraphError::Execution(format!(
                "negative offset {} into {}",
                offset, self.buffers[b].name
            )));
        }
        let at = offset as usize + extra;
        if at >= len {
            return Err(GraphError::Execution(format!(
                "offset {} out of bounds for {} ({} elements)",
                at, self.buffers[b].name, len
            )));
        }
        Ok((b, at))
    }

    fn eval(&self, expr: &Expr) -> Result<f64> {
        match expr {
            Expr::Literal(v) => Ok(*v),
            Expr::Index(var) => self
                .vars
                .get(var.0)
                .map(|&i| i as f64)
                .ok_or_else(|| GraphError::Execution(format!("loop variable i{} unbound", var.0))),
            Expr::Load(ptr) => {
                let (b, at) = self.address(ptr, 0)?;
                Ok(self.memory[b][at])
            }
            Expr::Binary { op, lhs, rhs } => Ok(op.apply(self.eval(lhs)?, self.eval(rhs)?)),
            Expr::Dot {
                lhs,
                lhs_stride,
                rhs,
                rhs_stride,
                count,
            } => {
                let mut sum = 0.0;
                for i in 0..*count {
                    let (lb, la) = self.address(lhs, i * lhs_stride)?;
                    let (rb, ra) = self.address(rhs, i * rhs_stride)?;
                    sum += self.memory[lb][la] * self.memory[rb][ra];
                }
                Ok(sum)
            }
            Expr::Cast { to, value } => Ok(to.quantize(self.eval(value)?)),
        }
    }
}

// ── Builder ────────────────────────────────────────────────────────────────

/// Builds one kernel. Loop bodies are collected on a stack of statement lists.
#[derive(Debug)]
pub struct FunctionEmitter {
    name: String,
    buffers: Vec<Buffer>,
    blocks: Vec<Vec<Stmt>>,
    next_var: usize,
}

impl FunctionEmitter {
    pub fn new(name: impl Into<String>) -> Self {
        FunctionEmitter {
            name: name.into(),
            buffers: Vec::new(),
            blocks: vec![Vec::new()],
            next_var: 0,
        }
    }

    fn declare(&mut self, name: String, kind: BufferKind, port_type: PortType, len: usize) -> BufferId {
        self.buffers.push(Buffer {
            name,
            kind,
            port_type,
            len,
        });
        BufferId(self.buffers.len() - 1)
    }

    pub fn declare_argument(&mut self, name: &str, port_type: PortType, len: usize) -> BufferId {
        self.declare(name.to_string(), BufferKind::Argument, port_type, len)
    }

    pub fn declare_result(&mut self, name: &str, port_type: PortType, len: usize) -> BufferId {
        self.declare(name.to_string(), BufferKind::Result, port_type, len)
    }

    pub fn declare_constant(&mut self, port_type: PortType, values: Vec<f64>) -> BufferId {
        let name = format!("c{}", self.buffers.len());
        let len = values.len();
        self.declare(name, BufferKind::Constant(values), port_type, len)
    }

    pub fn declare_local(&mut self, port_type: PortType, len: usize) -> BufferId {
        let name = format!("t{}", self.buffers.len());
        self.declare(name, BufferKind::Local, port_type, len)
    }

    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(id.0)
    }

    pub fn pointer(&self, buffer: BufferId, offset: Expr) -> Pointer {
        Pointer { buffer, offset }
    }

    /// `ptr + delta`: offset addressing relative to an existing pointer.
    pub fn pointer_offset(&self, ptr: &Pointer, delta: Expr) -> Pointer {
        Pointer {
            buffer: ptr.buffer,
            offset: ptr.offset.clone() + delta,
        }
    }

    pub fn load(&self, buffer: BufferId, offset: Expr) -> Expr {
        Expr::Load(Box::new(Pointer { buffer, offset }))
    }

    pub fn store(&mut self, buffer: BufferId, offset: Expr, value: Expr) {
        self.push(Stmt::Store {
            ptr: Pointer { buffer, offset },
            value,
        });
    }

    pub fn operation(&self, op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(op, lhs, rhs)
    }

    pub fn cast(&self, to: PortType, value: Expr) -> Expr {
        Expr::Cast {
            to,
            value: Box::new(value),
        }
    }

    pub fn dot_product(&self, count: usize, lhs: Pointer, rhs: Pointer) -> Expr {
        self.strided_dot_product(count, lhs, 1, rhs, 1)
    }

    pub fn strided_dot_product(
        &self,
        count: usize,
        lhs: Pointer,
        lhs_stride: usize,
        rhs: Pointer,
        rhs_stride: usize,
    ) -> Expr {
        Expr::Dot {
            lhs: Box::new(lhs),
            lhs_stride,
            rhs: Box::new(rhs),
            rhs_stride,
            count,
        }
    }

    fn push(&mut self, stmt: Stmt) {
        if let Some(block) = self.blocks.last_mut() {
            block.push(stmt);
        }
    }

    fn emit_loop(
        &mut self,
        count: usize,
        parallel: bool,
        captured: Vec<BufferId>,
        body: impl FnOnce(&mut FunctionEmitter, Expr) -> Result<()>,
    ) -> Result<()> {
        let var = LoopVar(self.next_var);
        self.next_var += 1;
        self.blocks.push(Vec::new());
        let outcome = body(self, Expr::Index(var));
        let stmts = self.blocks.pop().unwrap_or_default();
        outcome?;
        if count == 0 || stmts.is_empty() {
            return Ok(());
        }
        self.push(Stmt::Loop {
            var,
            count,
            parallel,
            captured,
            body: stmts,
        });
        Ok(())
    }

    /// Sequential loop `for i in 0..count`.
    pub fn for_range(
        &mut self,
        count: usize,
        body: impl FnOnce(&mut FunctionEmitter, Expr) -> Result<()>,
    ) -> Result<()> {
        self.emit_loop(count, false, Vec::new(), body)
    }

    /// Parallel loop over independent iterations. `captured` lists the
    /// buffers the body shares with the enclosing function.
    pub fn parallel_for(
        &mut self,
        count: usize,
        captured: &[BufferId],
        body: impl FnOnce(&mut FunctionEmitter, Expr) -> Result<()>,
    ) -> Result<()> {
        self.emit_loop(count, true, captured.to_vec(), body)
    }

    /// Loop nest over `sizes` in row-major order; the body sees one index per
    /// dimension.
    pub fn for_each_index(
        &mut self,
        sizes: &[usize],
        body: impl FnOnce(&mut FunctionEmitter, &[Expr]) -> Result<()>,
    ) -> Result<()> {
        fn nest(
            f: &mut FunctionEmitter,
            sizes: &[usize],
            indices: &mut Vec<Expr>,
            body: Box<dyn FnOnce(&mut FunctionEmitter, &[Expr]) -> Result<()> + '_>,
        ) -> Result<()> {
            match sizes.split_first() {
                None => body(f, indices.as_slice()),
                Some((&count, rest)) => f.for_range(count, |f, i| {
                    indices.push(i);
                    nest(f, rest, indices, body)
                }),
            }
        }
        let mut indices = Vec::with_capacity(sizes.len());
        nest(self, sizes, &mut indices, Box::new(body))
    }

    /// Flat offset of an active-region coordinate within `layout`.
    pub fn layout_offset(&self, layout: &PortMemoryLayout, coords: &[Expr]) -> Expr {
        let inc = layout.cumulative_increment();
        coords
            .iter()
            .enumerate()
            .fold(Expr::Literal(0.0), |acc, (d, c)| {
                acc + (c.clone() + Expr::index(layout.offset(d))) * Expr::index(inc[d])
            })
    }

    /// Fill every element of `buffer` with `value`.
    pub fn fill(&mut self, buffer: BufferId, len: usize, value: f64) -> Result<()> {
        self.for_range(len, |f, i| {
            f.store(buffer, i, Expr::Literal(value));
            Ok(())
        })
    }

    /// Copy `count` elements from `src + src_start` to `dst + dst_start`.
    pub fn copy(
        &mut self,
        dst: BufferId,
        dst_start: usize,
        src: BufferId,
        src_start: usize,
        count: usize,
    ) -> Result<()> {
        self.for_range(count, |f, i| {
            let value = f.load(src, i.clone() + Expr::index(src_start));
            f.store(dst, i + Expr::index(dst_start), value);
            Ok(())
        })
    }

    pub fn finish(mut self) -> Kernel {
        let body = self.blocks.pop().unwrap_or_default();
        Kernel {
            name: self.name,
            buffers: self.buffers,
            body,
        }
    }
}

// ── C printer ──────────────────────────────────────────────────────────────

struct Printer<'k> {
    buffers: &'k [Buffer],
}

impl Printer<'_> {
    fn name(&self, b: BufferId) -> &str {
        self.buffers.get(b.0).map(|b| b.name.as_str()).unwrap_or("?")
    }

    fn pointer(&self, p: &Pointer) -> String {
        format!("{}[{}]", self.name(p.buffer), self.expr(&p.offset))
    }

    fn pointer_base(&self, p: &Pointer) -> String {
        match p.offset.as_literal() {
            Some(v) if v == 0.0 => self.name(p.buffer).to_string(),
            _ => format!("{} + {}", self.name(p.buffer), self.expr(&p.offset)),
        }
    }

    fn expr(&self, e: &Expr) -> String {
        match e {
            Expr::Literal(v) => format!("{}", v),
            Expr::Index(var) => format!("i{}", var.0),
            Expr::Load(p) => self.pointer(p),
            Expr::Binary { op, lhs, rhs } => {
                format!("({} {} {})", self.expr(lhs), op.symbol(), self.expr(rhs))
            }
            Expr::Dot {
                lhs,
                lhs_stride,
                rhs,
                rhs_stride,
                count,
            } => format!(
                "dot({}, {}, {}, {}, {})",
                count,
                self.pointer_base(lhs),
                lhs_stride,
                self.pointer_base(rhs),
                rhs_stride
            ),
            Expr::Cast { to, value } => format!("({}){}", to.c_type(), self.expr(value)),
        }
    }

    fn stmts(&self, f: &mut fmt::Formatter<'_>, stmts: &[Stmt], depth: usize) -> fmt::Result {
        let pad = "    ".repeat(depth);
        for s in stmts {
            match s {
                Stmt::Loop {
                    var,
                    count,
                    parallel,
                    captured,
                    body,
                } => {
                    if *parallel {
                        let names: Vec<&str> = captured.iter().map(|&b| self.name(b)).collect();
                        writeln!(f, "{}#pragma omp parallel for shared({})", pad, names.join(", "))?;
                    }
                    writeln!(
                        f,
                        "{}for (int i{v} = 0; i{v} < {}; ++i{v}) {{",
                        pad,
                        count,
                        v = var.0
                    )?;
                    self.stmts(f, body, depth + 1)?;
                    writeln!(f, "{}}}", pad)?;
                }
                Stmt::Store { ptr, value } => {
                    writeln!(f, "{}{} = {};", pad, self.pointer(ptr), self.expr(value))?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let printer = Printer {
            buffers: &self.buffers,
        };
        let mut params = Vec::new();
        for b in &self.buffers {
            match b.kind {
                BufferKind::Argument => params.push(format!("const {}* {}", b.port_type.c_type(), b.name)),
                BufferKind::Result => params.push(format!("{}* {}", b.port_type.c_type(), b.name)),
                _ => {}
            }
        }
        writeln!(f, "void {}({}) {{", self.name, params.join(", "))?;
        for b in &self.buffers {
            match &b.kind {
                BufferKind::Constant(values) => {
                    let items: Vec<String> = values.iter().map(|v| format!("{}", v)).collect();
                    writeln!(
                        f,
                        "    static const {} {}[{}] = {{{}}};",
                        b.port_type.c_type(),
                        b.name,
                        b.len,
                        items.join(", ")
                    )?;
                }
                BufferKind::Local => {
                    writeln!(f, "    {} {}[{}] = {{0}};", b.port_type.c_type(), b.name, b.len)?;
                }
                _ => {}
            }
        }
        printer.stmts(f, &self.body, 1)?;
        writeln!(f, "}}")
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic_folds() {
        let i = Expr::Index(LoopVar(0));
        assert_eq!(i.clone() * Expr::index(1) + Expr::index(0), i);
        assert_eq!(Expr::index(2) + Expr::index(3), Expr::Literal(5.0));
        assert_eq!(i * Expr::index(0), Expr::Literal(0.0));
    }

    #[test]
    fn executes_elementwise_add() {
        let mut f = FunctionEmitter::new("add");
        let a = f.declare_argument("a", PortType::Real64, 3);
        let b = f.declare_argument("b", PortType::Real64, 3);
        let out = f.declare_result("out", PortType::Real64, 3);
        f.for_range(3, |f, i| {
            let v = f.operation(BinaryOp::Add, f.load(a, i.clone()), f.load(b, i.clone()));
            f.store(out, i, v);
            Ok(())
        })
        .unwrap();
        let kernel = f.finish();
        let result = kernel
            .execute(&[
                PortValue::from(vec![1.0, 2.0, 3.0]),
                PortValue::from(vec![10.0, 20.0, 30.0]),
            ])
            .unwrap();
        assert_eq!(result, PortValue::from(vec![11.0, 22.0, 33.0]));
    }

    #[test]
    fn strided_dot_product_reads_columns() {
        let mut f = FunctionEmitter::new("col");
        let m = f.declare_constant(PortType::Real32, vec![1.0, 2.0, 3.0, 4.0]);
        let v = f.declare_constant(PortType::Real32, vec![1.0, 1.0]);
        let out = f.declare_result("out", PortType::Real32, 2);
        f.for_range(2, |f, j| {
            let lhs = f.pointer(m, j.clone());
            let rhs = f.pointer(v, Expr::index(0));
            let dot = f.strided_dot_product(2, lhs, 2, rhs, 1);
            f.store(out, j, dot);
            Ok(())
        })
        .unwrap();
        let result = f.finish().execute(&[]).unwrap();
        assert_eq!(result, PortValue::from(vec![4.0f32, 6.0]));
    }

    #[test]
    fn rejects_wrong_argument_length() {
        let mut f = FunctionEmitter::new("k");
        f.declare_argument("x", PortType::Real32, 2);
        f.declare_result("y", PortType::Real32, 2);
        let err = f.finish().execute(&[PortValue::from(vec![1.0f32])]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidArgument(_)));
    }

    #[test]
    fn out_of_bounds_load_is_an_error() {
        let mut f = FunctionEmitter::new("k");
        let x = f.declare_argument("x", PortType::Real32, 2);
        let y = f.declare_result("y", PortType::Real32, 3);
        f.copy(y, 0, x, 0, 3).unwrap();
        let err = f
            .finish()
            .execute(&[PortValue::from(vec![1.0f32, 2.0])])
            .unwrap_err();
        assert!(matches!(err, GraphError::Execution(_)));
    }

    #[test]
    fn prints_parallel_loop_with_captures() {
        let mut f = FunctionEmitter::new("k");
        let x = f.declare_argument("x", PortType::Real32, 2);
        let y = f.declare_result("y", PortType::Real32, 2);
        f.parallel_for(2, &[x, y], |f, i| {
            let v = f.load(x, i.clone());
            f.store(y, i, v);
            Ok(())
        })
        .unwrap();
        let text = f.finish().to_string();
        assert_eq!(
            text,
            "void k(const float* x, float* y) {\n    #pragma omp parallel for shared(x, y)\n    for (int i0 = 0; i0 < 2; ++i0) {\n        y[i0] = x[i0];\n    }\n}\n"
        );
    }
}
