//! x86-64 code generation, AT&T syntax, System V AMD64 ABI.
//!
//! Emission uses a fixed register discipline: `%rax` is the expression
//! accumulator, and the second operand of every binary form travels
//! through the runtime stack into `%rdi`. A depth counter tracks pushes
//! and pops and must return to zero after every function body. All text
//! goes through [`AsmSink`], a fixed-capacity buffer that truncates
//! rather than grow, so emission is total under bounded memory.

use std::fmt::{self, Write};

use crate::parse::{BinOp, NodeId, NodeKind, ObjId};
use crate::types::{TypeId, TypeKind, expr_ty};
use crate::{CompileError, Compiler, ErrorKind, Result};

/// Capacity of the assembly text sink.
pub const CG_BUF_SIZE: usize = 64 * 1024;

const ARGREG8: [&str; 6] = ["%dil", "%sil", "%dl", "%cl", "%r8b", "%r9b"];
const ARGREG64: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];

/// Fixed-capacity text sink. Writes past capacity are silently dropped;
/// the bytes already written never move.
#[derive(Debug)]
pub struct AsmSink {
  buf: Vec<u8>,
  cap: usize,
}

impl AsmSink {
  /// A sink that holds at most `cap` bytes.
  #[must_use] pub fn new(cap: usize) -> Self {
    AsmSink { buf: Vec::with_capacity(cap), cap }
  }

  pub(crate) fn print(&mut self, args: fmt::Arguments<'_>) {
    let _ = self.write_fmt(args);
  }

  /// The emitted text.
  #[must_use] pub fn as_bytes(&self) -> &[u8] { &self.buf }

  /// Number of bytes emitted (capped at the capacity).
  #[must_use] pub fn len(&self) -> usize { self.buf.len() }

  /// Returns true if nothing has been emitted.
  #[must_use] pub fn is_empty(&self) -> bool { self.buf.is_empty() }
}

impl fmt::Write for AsmSink {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let room = self.cap - self.buf.len();
    let n = s.len().min(room);
    self.buf.extend_from_slice(&s.as_bytes()[..n]);
    Ok(())
  }
}

macro_rules! emit {
  ($g:expr, $fmt:literal $($arg:tt)*) => {
    $g.out.print(format_args!(concat!($fmt, "\n") $($arg)*))
  };
}

/// Emit assembly for the whole program. All emission state (label
/// counter, stack depth, sink) is fresh per call, so generating twice
/// from the same AST yields identical bytes.
pub fn codegen(cc: &mut Compiler<'_>, prog: &[ObjId]) -> Result<AsmSink> {
  assign_lvar_offsets(cc, prog);
  let mut g = Gen {
    cc,
    out: AsmSink::new(CG_BUF_SIZE),
    depth: 0,
    counter: 1,
    current_fn: None,
  };
  g.emit_data(prog);
  g.emit_text(prog)?;
  Ok(g.out)
}

/// Round `n` up to the nearest multiple of `align`.
fn align_to(n: i64, align: i64) -> i64 {
  (n + align - 1) / align * align
}

/// Walk each function's locals in declaration order, assigning slots
/// below `%rbp`, and round the frame up to 16 bytes.
fn assign_lvar_offsets(cc: &mut Compiler<'_>, prog: &[ObjId]) {
  for &func in prog {
    if !cc.objs[func].is_function { continue }
    let locals = cc.objs[func].locals.clone();
    let mut offset = 0;
    for &var in &locals {
      offset += cc.types[cc.objs[var].ty].size;
      cc.objs[var].offset = -offset;
    }
    cc.objs[func].stack_size = align_to(offset, 16);
  }
}

struct Gen<'a, 'b> {
  cc: &'b Compiler<'a>,
  out: AsmSink,
  depth: i64,
  counter: u32,
  current_fn: Option<ObjId>,
}

impl Gen<'_, '_> {
  fn count(&mut self) -> u32 {
    let c = self.counter;
    self.counter += 1;
    c
  }

  fn push(&mut self) {
    emit!(self, "  push %rax");
    self.depth += 1;
  }

  fn pop(&mut self, arg: &str) {
    emit!(self, "  pop {}", arg);
    self.depth -= 1;
  }

  fn node_ty(&self, node: NodeId) -> TypeId { expr_ty(self.cc, node) }

  /// Compute the absolute address of a node into `%rax`. Errors when
  /// the node does not reside in memory.
  fn gen_addr(&mut self, node: NodeId) -> Result<()> {
    let cc = self.cc;
    match cc.nodes[node].kind {
      NodeKind::Var(var) => {
        let obj = &cc.objs[var];
        if obj.is_local {
          emit!(self, "  lea {}(%rbp), %rax", obj.offset);
        } else {
          emit!(self, "  lea {}(%rip), %rax", obj.name);
        }
        Ok(())
      }
      NodeKind::Deref(lhs) => self.gen_expr(lhs),
      _ => Err(cc.err_tok(ErrorKind::Codegen, cc.nodes[node].tok, "not an lvalue")),
    }
  }

  /// Load the value `%rax` points at. Arrays are left as addresses;
  /// this no-op is where array-to-pointer decay happens.
  fn load(&mut self, ty: TypeId) {
    let cc = self.cc;
    let ty = &cc.types[ty];
    if ty.kind == TypeKind::Array { return }
    if ty.size == 1 {
      emit!(self, "  movsbq (%rax), %rax");
    } else {
      emit!(self, "  mov (%rax), %rax");
    }
  }

  /// Store `%rax` to the address on the stack top.
  fn store(&mut self, ty: TypeId) {
    self.pop("%rdi");
    if self.cc.types[ty].size == 1 {
      emit!(self, "  mov %al, (%rdi)");
    } else {
      emit!(self, "  mov %rax, (%rdi)");
    }
  }

  fn gen_expr(&mut self, node: NodeId) -> Result<()> {
    let cc = self.cc;
    match cc.nodes[node].kind {
      NodeKind::Num(val) => {
        emit!(self, "  mov ${}, %rax", val);
        Ok(())
      }
      NodeKind::Neg(lhs) => {
        self.gen_expr(lhs)?;
        emit!(self, "  neg %rax");
        Ok(())
      }
      NodeKind::Var(_) => {
        self.gen_addr(node)?;
        self.load(self.node_ty(node));
        Ok(())
      }
      NodeKind::Deref(lhs) => {
        self.gen_expr(lhs)?;
        self.load(self.node_ty(node));
        Ok(())
      }
      NodeKind::Addr(lhs) => self.gen_addr(lhs),
      NodeKind::Assign(lhs, rhs) => {
        self.gen_addr(lhs)?;
        self.push();
        self.gen_expr(rhs)?;
        self.store(self.node_ty(node));
        Ok(())
      }
      NodeKind::Funcall { name, ref args } => {
        if args.len() > ARGREG64.len() {
          return Err(cc.err_tok(ErrorKind::Codegen, cc.nodes[node].tok, "too many arguments"))
        }
        for &arg in args {
          self.gen_expr(arg)?;
          self.push();
        }
        for i in (0..args.len()).rev() {
          self.pop(ARGREG64[i]);
        }
        emit!(self, "  mov $0, %rax");
        emit!(self, "  call {}", name);
        Ok(())
      }
      NodeKind::Binop(op, lhs, rhs) => {
        self.gen_expr(rhs)?;
        self.push();
        self.gen_expr(lhs)?;
        self.pop("%rdi");
        match op {
          BinOp::Add => emit!(self, "  add %rdi, %rax"),
          BinOp::Sub => emit!(self, "  sub %rdi, %rax"),
          BinOp::Mul => emit!(self, "  imul %rdi, %rax"),
          BinOp::Div => {
            emit!(self, "  cqo");
            emit!(self, "  idiv %rdi");
          }
          BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le => {
            emit!(self, "  cmp %rdi, %rax");
            let set = match op {
              BinOp::Eq => "sete",
              BinOp::Ne => "setne",
              BinOp::Lt => "setl",
              _ => "setle",
            };
            emit!(self, "  {} %al", set);
            emit!(self, "  movzb %al, %rax");
          }
        }
        Ok(())
      }
      _ => Err(cc.err_tok(ErrorKind::Codegen, cc.nodes[node].tok, "invalid expression")),
    }
  }

  fn gen_stmt(&mut self, node: NodeId) -> Result<()> {
    let cc = self.cc;
    match cc.nodes[node].kind {
      NodeKind::If { cond, then, els } => {
        let c = self.count();
        self.gen_expr(cond)?;
        emit!(self, "  cmp $0, %rax");
        emit!(self, "  je  .L.else.{}", c);
        self.gen_stmt(then)?;
        emit!(self, "  jmp .L.end.{}", c);
        emit!(self, ".L.else.{}:", c);
        if let Some(els) = els {
          self.gen_stmt(els)?;
        }
        emit!(self, ".L.end.{}:", c);
        Ok(())
      }
      NodeKind::For { init, cond, inc, body } => {
        let c = self.count();
        if let Some(init) = init {
          self.gen_stmt(init)?;
        }
        emit!(self, ".L.begin.{}:", c);
        if let Some(cond) = cond {
          self.gen_expr(cond)?;
          emit!(self, "  cmp $0, %rax");
          emit!(self, "  je  .L.end.{}", c);
        }
        self.gen_stmt(body)?;
        if let Some(inc) = inc {
          self.gen_expr(inc)?;
        }
        emit!(self, "  jmp .L.begin.{}", c);
        emit!(self, ".L.end.{}:", c);
        Ok(())
      }
      NodeKind::Block(ref body) => {
        for &stmt in body {
          self.gen_stmt(stmt)?;
        }
        Ok(())
      }
      NodeKind::Return(expr) => {
        self.gen_expr(expr)?;
        let func = self.current_fn.expect("return outside a function");
        emit!(self, "  jmp .L.return.{}", cc.objs[func].name);
        Ok(())
      }
      NodeKind::ExprStmt(expr) => self.gen_expr(expr),
      _ => Err(cc.err_tok(ErrorKind::Codegen, cc.nodes[node].tok, "invalid statement")),
    }
  }

  fn emit_data(&mut self, prog: &[ObjId]) {
    let cc = self.cc;
    for &var in prog {
      let obj = &cc.objs[var];
      if obj.is_function { continue }

      emit!(self, "  .data");
      emit!(self, "  .globl {}", obj.name);
      emit!(self, "{}:", obj.name);

      match obj.init_data {
        Some(init) => {
          // Initializer bytes are `char` data and print signed.
          for &b in init {
            emit!(self, "  .byte {}", b as i8);
          }
        }
        None => emit!(self, "  .zero {}", cc.types[obj.ty].size),
      }
    }
  }

  fn emit_text(&mut self, prog: &[ObjId]) -> Result<()> {
    let cc = self.cc;
    for &func in prog {
      let obj = &cc.objs[func];
      if !obj.is_function { continue }

      if obj.params.len() > ARGREG64.len() {
        return Err(CompileError::plain(ErrorKind::Codegen, "too many parameters"))
      }

      emit!(self, "  .globl {}", obj.name);
      emit!(self, "  .text");
      emit!(self, "{}:", obj.name);
      self.current_fn = Some(func);

      // Prologue
      emit!(self, "  push %rbp");
      emit!(self, "  mov %rsp, %rbp");
      emit!(self, "  sub ${}, %rsp", obj.stack_size);

      // Spill register arguments into their stack slots.
      for (i, &param) in obj.params.iter().enumerate() {
        let var = &cc.objs[param];
        let reg = if cc.types[var.ty].size == 1 { ARGREG8[i] } else { ARGREG64[i] };
        emit!(self, "  mov {}, {}(%rbp)", reg, var.offset);
      }

      self.gen_stmt(obj.body.expect("function without a body"))?;
      assert_eq!(self.depth, 0, "unbalanced stack in {}", obj.name);

      // Epilogue
      emit!(self, ".L.return.{}:", obj.name);
      emit!(self, "  mov %rbp, %rsp");
      emit!(self, "  pop %rbp");
      emit!(self, "  ret");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn align_to_rounds_up() {
    assert_eq!(align_to(0, 16), 0);
    assert_eq!(align_to(5, 8), 8);
    assert_eq!(align_to(11, 8), 16);
    assert_eq!(align_to(16, 16), 16);
  }

  #[test]
  fn sink_truncates_at_capacity() {
    let mut sink = AsmSink::new(16);
    sink.print(format_args!("0123456789"));
    sink.print(format_args!("abcdefghij"));
    assert_eq!(sink.len(), 16);
    assert_eq!(sink.as_bytes(), b"0123456789abcdef");
    // Further writes change nothing.
    sink.print(format_args!("xyz"));
    assert_eq!(sink.as_bytes(), b"0123456789abcdef");
  }

  #[test]
  fn sink_starts_empty() {
    let sink = AsmSink::new(8);
    assert!(sink.is_empty());
    assert_eq!(sink.as_bytes(), b"");
  }
}
