//! A tiny C-subset compiler designed to run inside a zero-knowledge guest.
//!
//! The pipeline is strictly linear: the [`tokenize`] pass turns the input
//! bytes into a token pool, the [`parse`] pass builds a type-elaborated
//! AST, and the [`codegen`] pass walks the AST and emits AT&T-syntax
//! x86-64 assembly into a bounded text sink. Everything a compilation
//! allocates (tokens, types, AST nodes, symbols, interned strings) is
//! charged against one fixed-size [`Arena`], so execution is fully
//! deterministic and memory use is bounded and reproducible.
//!
//! Records reference each other through typed integer handles
//! ([`idx::IdxVec`]) rather than pointers; the handle pools live in the
//! [`Compiler`] context value together with the source text and the
//! arena, which is threaded through every pass. There is no global
//! mutable state: compiling the same bytes twice produces byte-identical
//! output.
//!
//! All I/O is mediated by the host bridge in [`guest`]: read a source
//! buffer, commit a byte journal, exit. The compiler proper only ever
//! sees a finite byte slice and writes to a finite byte slice.

pub mod arena;
pub mod codegen;
pub mod guest;
pub mod idx;
pub mod parse;
pub mod tokenize;
pub mod types;

use std::borrow::Cow;
use std::fmt;

pub use arena::Arena;
pub use codegen::AsmSink;

use idx::IdxVec;
use parse::{Node, NodeId, Obj, ObjId};
use tokenize::{Token, TokenId};
use types::{Type, TypeId, TypeKind};

/// Classifies a fatal compilation failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
  /// Tokenizer errors: bad bytes, unclosed literals or comments.
  Lex,
  /// Parser errors: unexpected tokens, undeclared names.
  Parse,
  /// Type elaboration errors: bad derefs, array assignment.
  Type,
  /// Code generation errors: non-lvalues, malformed trees.
  Codegen,
  /// Arena exhaustion.
  Resource,
}

/// A fatal error. Compilation never recovers; the first error wins.
#[derive(Clone, Debug)]
pub struct CompileError {
  /// What stage the error belongs to.
  pub kind: ErrorKind,
  /// Byte offset of the offending token in the source, when known.
  pub loc: Option<usize>,
  /// Human-readable message.
  pub msg: Cow<'static, str>,
}

/// The result type used throughout the compiler.
pub type Result<T, E = CompileError> = std::result::Result<T, E>;

impl CompileError {
  pub(crate) fn plain(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Self {
    CompileError { kind, loc: None, msg: msg.into() }
  }

  pub(crate) fn at(kind: ErrorKind, loc: usize, msg: impl Into<Cow<'static, str>>) -> Self {
    CompileError { kind, loc: Some(loc), msg: msg.into() }
  }

  /// Render the diagnostic the way the guest reports it: the source
  /// text, a caret under the offending byte, then the message.
  #[must_use] pub fn report(&self, src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    let text = String::from_utf8_lossy(&src[..end]);
    match self.loc {
      Some(pos) => format!("{text}\n{:pos$}^ {}", "", self.msg, pos = pos.min(end)),
      None => self.msg.clone().into_owned(),
    }
  }
}

impl fmt::Display for CompileError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.loc {
      Some(pos) => write!(f, "error at byte {pos}: {}", self.msg),
      None => write!(f, "error: {}", self.msg),
    }
  }
}

impl std::error::Error for CompileError {}

/// The compilation context: the source text, the arena, and the record
/// pools every pass reads and extends.
///
/// The first two slots of the type pool are the shared `char` and `int`
/// singletons; see [`types::TY_CHAR`] and [`types::TY_INT`].
pub struct Compiler<'a> {
  /// The arena charged for every allocation of this compilation.
  pub arena: &'a Arena,
  /// The source text. A NUL byte (or the end of the slice) ends it.
  pub src: &'a [u8],
  /// Token pool, filled by [`tokenize::tokenize`].
  pub tokens: IdxVec<TokenId, Token<'a>>,
  /// Type descriptor pool.
  pub types: IdxVec<TypeId, Type>,
  /// AST node pool.
  pub nodes: IdxVec<NodeId, Node<'a>>,
  /// Symbol pool: locals, globals, and functions.
  pub objs: IdxVec<ObjId, Obj<'a>>,
}

impl<'a> Compiler<'a> {
  /// Construct a fresh context over `src`. Installs the `char` and `int`
  /// singletons; they are never mutated after this point, so they take
  /// no arena charge.
  #[must_use] pub fn new(arena: &'a Arena, src: &'a [u8]) -> Self {
    let mut types = IdxVec::new();
    types.push(Type::new(TypeKind::Char, 1));
    types.push(Type::new(TypeKind::Int, 8));
    Compiler {
      arena,
      src,
      tokens: IdxVec::new(),
      types,
      nodes: IdxVec::new(),
      objs: IdxVec::new(),
    }
  }

  /// The source bytes a token covers.
  #[must_use] pub fn tok_text(&self, tok: TokenId) -> &'a [u8] {
    let tok = &self.tokens[tok];
    &self.src[tok.loc..tok.loc + tok.len]
  }

  /// Does a token read exactly `text`? Compares the raw source span, so
  /// it works uniformly for punctuators, keywords and identifiers.
  #[must_use] pub fn tok_equal(&self, tok: TokenId, text: &str) -> bool {
    self.tok_text(tok) == text.as_bytes()
  }

  pub(crate) fn push_token(&mut self, tok: Token<'a>) -> Result<TokenId> {
    self.arena.reserve(size_of::<Token<'a>>(), 8)?;
    Ok(self.tokens.push(tok))
  }

  pub(crate) fn push_type(&mut self, ty: Type) -> Result<TypeId> {
    self.arena.reserve(size_of::<Type>(), 8)?;
    Ok(self.types.push(ty))
  }

  pub(crate) fn push_node(&mut self, node: Node<'a>) -> Result<NodeId> {
    self.arena.reserve(size_of::<Node<'a>>(), 8)?;
    Ok(self.nodes.push(node))
  }

  pub(crate) fn push_obj(&mut self, obj: Obj<'a>) -> Result<ObjId> {
    self.arena.reserve(size_of::<Obj<'a>>(), 8)?;
    Ok(self.objs.push(obj))
  }

  pub(crate) fn err_at(
    &self, kind: ErrorKind, loc: usize, msg: impl Into<Cow<'static, str>>,
  ) -> CompileError {
    CompileError::at(kind, loc, msg)
  }

  pub(crate) fn err_tok(
    &self, kind: ErrorKind, tok: TokenId, msg: impl Into<Cow<'static, str>>,
  ) -> CompileError {
    CompileError::at(kind, self.tokens[tok].loc, msg)
  }
}

/// Compile one source buffer to assembly text.
///
/// The source ends at the first NUL byte or at the end of the slice,
/// whichever comes first. On success the returned sink holds the emitted
/// assembly; any failure aborts the pipeline at the first error.
pub fn compile<'a>(arena: &'a Arena, src: &'a [u8]) -> Result<AsmSink> {
  let mut cc = Compiler::new(arena, src);
  tokenize::tokenize(&mut cc)?;
  let prog = parse::parse(&mut cc)?;
  codegen::codegen(&mut cc, &prog)
}
