//! Type descriptors and the type elaboration pass.
//!
//! The descriptor set is tiny: `char`, `int`, pointers, arrays, and
//! function types. Pointers and arrays deliberately share the single
//! `base` field, so code that only cares about "something that points at
//! elements" can test [`Compiler::has_base`] instead of matching on the
//! kind; that one shared path is what makes array decay fall out of
//! pointer arithmetic for free.

use smallvec::SmallVec;

use crate::idx::mk_id;
use crate::parse::{BinOp, NodeId, NodeKind};
use crate::tokenize::TokenId;
use crate::{CompileError, Compiler, ErrorKind, Result};

mk_id! {
  /// Handle of a type descriptor in [`Compiler::types`].
  TypeId,
}

/// The shared `char` singleton, installed by [`Compiler::new`].
pub const TY_CHAR: TypeId = TypeId(0);
/// The shared `int` singleton. `int` is deliberately 8 bytes wide in
/// this dialect, the same as a pointer.
pub const TY_INT: TypeId = TypeId(1);

/// Type descriptor kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
  Char,
  Int,
  Ptr,
  Func,
  Array,
}

/// One type descriptor.
#[derive(Clone, Debug)]
pub struct Type {
  pub kind: TypeKind,
  /// `sizeof` value in bytes. Zero for function types.
  pub size: i64,
  /// Pointee for pointers, element type for arrays.
  pub base: Option<TypeId>,
  /// Declarator name token, attached while parsing declarations.
  pub name: Option<TokenId>,
  /// Element count, if `kind` is [`TypeKind::Array`].
  pub array_len: i64,
  /// Return type, if `kind` is [`TypeKind::Func`].
  pub return_ty: Option<TypeId>,
  /// Parameter types, if `kind` is [`TypeKind::Func`].
  pub params: SmallVec<[TypeId; 4]>,
}

impl Type {
  pub(crate) fn new(kind: TypeKind, size: i64) -> Self {
    Type { kind, size, base: None, name: None, array_len: 0, return_ty: None, params: SmallVec::new() }
  }
}

impl<'a> Compiler<'a> {
  /// Is this `char` or `int`?
  #[must_use] pub fn is_integer(&self, ty: TypeId) -> bool {
    matches!(self.types[ty].kind, TypeKind::Char | TypeKind::Int)
  }

  /// Pointer/array duality predicate: true for anything with an element
  /// type.
  #[must_use] pub fn has_base(&self, ty: TypeId) -> bool {
    self.types[ty].base.is_some()
  }

  /// A fresh pointer-to-`base` descriptor, 8 bytes wide.
  pub fn pointer_to(&mut self, base: TypeId) -> Result<TypeId> {
    let mut ty = Type::new(TypeKind::Ptr, 8);
    ty.base = Some(base);
    self.push_type(ty)
  }

  /// A fresh array descriptor of `len` elements of `base`.
  pub fn array_of(&mut self, base: TypeId, len: i64) -> Result<TypeId> {
    let size = self.types[base].size
      .checked_mul(len)
      .ok_or_else(|| CompileError::plain(ErrorKind::Parse, "array type too large"))?;
    let mut ty = Type::new(TypeKind::Array, size);
    ty.base = Some(base);
    ty.array_len = len;
    self.push_type(ty)
  }

  /// A fresh function descriptor returning `return_ty`.
  pub fn func_type(&mut self, return_ty: TypeId) -> Result<TypeId> {
    let mut ty = Type::new(TypeKind::Func, 0);
    ty.return_ty = Some(return_ty);
    self.push_type(ty)
  }

  /// Shallow clone of a descriptor into a fresh pool slot.
  pub fn copy_type(&mut self, ty: TypeId) -> Result<TypeId> {
    let copy = self.types[ty].clone();
    self.push_type(copy)
  }
}

/// The type of an already-elaborated expression node.
pub(crate) fn expr_ty(cc: &Compiler<'_>, node: NodeId) -> TypeId {
  cc.nodes[node].ty.expect("expression not typed")
}

/// Post-order type elaboration. Idempotent: a node that already has a
/// type is left untouched, children included. Statement kinds recurse
/// into their children but take no type themselves.
pub fn add_type(cc: &mut Compiler<'_>, node: NodeId) -> Result<()> {
  if cc.nodes[node].ty.is_some() { return Ok(()) }

  let kind = cc.nodes[node].kind.clone();
  let ty = match kind {
    NodeKind::Num(_) => Some(TY_INT),

    NodeKind::Var(obj) => Some(cc.objs[obj].ty),

    NodeKind::Binop(op, lhs, rhs) => {
      add_type(cc, lhs)?;
      add_type(cc, rhs)?;
      match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => Some(expr_ty(cc, lhs)),
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le => Some(TY_INT),
      }
    }

    NodeKind::Neg(lhs) => {
      add_type(cc, lhs)?;
      Some(expr_ty(cc, lhs))
    }

    NodeKind::Assign(lhs, rhs) => {
      add_type(cc, lhs)?;
      add_type(cc, rhs)?;
      let lty = expr_ty(cc, lhs);
      if cc.types[lty].kind == TypeKind::Array {
        return Err(cc.err_tok(ErrorKind::Type, cc.nodes[lhs].tok, "not an lvalue"))
      }
      Some(lty)
    }

    NodeKind::Addr(lhs) => {
      add_type(cc, lhs)?;
      let lty = expr_ty(cc, lhs);
      let pointee = match cc.types[lty].kind {
        TypeKind::Array => cc.types[lty].base.expect("array without element type"),
        _ => lty,
      };
      Some(cc.pointer_to(pointee)?)
    }

    NodeKind::Deref(lhs) => {
      add_type(cc, lhs)?;
      let lty = expr_ty(cc, lhs);
      match cc.types[lty].base {
        Some(base) => Some(base),
        None => {
          return Err(cc.err_tok(ErrorKind::Type, cc.nodes[node].tok, "invalid pointer dereference"))
        }
      }
    }

    NodeKind::Funcall { ref args, .. } => {
      for &arg in args { add_type(cc, arg)? }
      Some(TY_INT)
    }

    NodeKind::ExprStmt(e) | NodeKind::Return(e) => {
      add_type(cc, e)?;
      None
    }

    NodeKind::Block(ref body) => {
      for &stmt in body { add_type(cc, stmt)? }
      None
    }

    NodeKind::If { cond, then, els } => {
      add_type(cc, cond)?;
      add_type(cc, then)?;
      if let Some(els) = els { add_type(cc, els)? }
      None
    }

    NodeKind::For { init, cond, inc, body } => {
      if let Some(init) = init { add_type(cc, init)? }
      if let Some(cond) = cond { add_type(cc, cond)? }
      if let Some(inc) = inc { add_type(cc, inc)? }
      add_type(cc, body)?;
      None
    }
  };

  cc.nodes[node].ty = ty;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::Arena;

  #[test]
  fn singleton_sizes() {
    let arena = Arena::new();
    let cc = Compiler::new(&arena, b"");
    assert_eq!(cc.types[TY_CHAR].size, 1);
    assert_eq!(cc.types[TY_INT].size, 8);
    assert!(cc.is_integer(TY_CHAR));
    assert!(cc.is_integer(TY_INT));
  }

  #[test]
  fn constructed_sizes() {
    let arena = Arena::new();
    let mut cc = Compiler::new(&arena, b"");
    let p = cc.pointer_to(TY_CHAR).unwrap();
    assert_eq!(cc.types[p].size, 8);
    assert!(cc.has_base(p));
    assert!(!cc.is_integer(p));

    let a = cc.array_of(TY_INT, 3).unwrap();
    assert_eq!(cc.types[a].size, 24);
    assert_eq!(cc.types[a].array_len, 3);
    assert_eq!(cc.types[a].base, Some(TY_INT));

    let f = cc.func_type(TY_INT).unwrap();
    assert_eq!(cc.types[f].kind, TypeKind::Func);
    assert_eq!(cc.types[f].return_ty, Some(TY_INT));
  }

  #[test]
  fn copy_type_is_independent() {
    let arena = Arena::new();
    let mut cc = Compiler::new(&arena, b"");
    let copy = cc.copy_type(TY_INT).unwrap();
    assert_ne!(copy, TY_INT);
    cc.types[copy].name = Some(crate::tokenize::TokenId(0));
    assert_eq!(cc.types[TY_INT].name, None);
  }

  #[test]
  fn huge_array_is_rejected() {
    let arena = Arena::new();
    let mut cc = Compiler::new(&arena, b"");
    let err = cc.array_of(TY_INT, i64::MAX / 2).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parse);
  }
}
