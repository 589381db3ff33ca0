//! End-to-end scenarios: source text in, assembly text out.

use zkcc::codegen::codegen;
use zkcc::parse::parse;
use zkcc::tokenize::tokenize;
use zkcc::types::add_type;
use zkcc::{Arena, Compiler, ErrorKind, compile};

fn asm(src: &str) -> String {
  let arena = Arena::new();
  let out = compile(&arena, src.as_bytes()).expect("compilation failed");
  String::from_utf8(out.as_bytes().to_vec()).expect("assembly is ASCII")
}

#[test]
fn empty_main() {
  assert_eq!(
    asm("int main(){ return 0; }"),
    "\
  .globl main
  .text
main:
  push %rbp
  mov %rsp, %rbp
  sub $0, %rsp
  mov $0, %rax
  jmp .L.return.main
.L.return.main:
  mov %rbp, %rsp
  pop %rbp
  ret
"
  );
}

#[test]
fn local_assignment() {
  assert_eq!(
    asm("int main(){ int a; a=3; return a; }"),
    "\
  .globl main
  .text
main:
  push %rbp
  mov %rsp, %rbp
  sub $16, %rsp
  lea -8(%rbp), %rax
  push %rax
  mov $3, %rax
  pop %rdi
  mov %rax, (%rdi)
  lea -8(%rbp), %rax
  mov (%rax), %rax
  jmp .L.return.main
.L.return.main:
  mov %rbp, %rsp
  pop %rbp
  ret
"
  );
}

#[test]
fn store_through_pointer() {
  assert_eq!(
    asm("int main(){ int x; int *y; y=&x; *y=7; return x; }"),
    "\
  .globl main
  .text
main:
  push %rbp
  mov %rsp, %rbp
  sub $16, %rsp
  lea -16(%rbp), %rax
  push %rax
  lea -8(%rbp), %rax
  pop %rdi
  mov %rax, (%rdi)
  lea -16(%rbp), %rax
  mov (%rax), %rax
  push %rax
  mov $7, %rax
  pop %rdi
  mov %rax, (%rdi)
  lea -8(%rbp), %rax
  mov (%rax), %rax
  jmp .L.return.main
.L.return.main:
  mov %rbp, %rsp
  pop %rbp
  ret
"
  );
}

#[test]
fn global_char_array() {
  let text = asm("char s[4]; int main(){ s[0]=65; return s[0]; }");
  // Zero-initialized global in the data section.
  assert!(text.starts_with("  .data\n  .globl s\ns:\n  .zero 4\n"));
  // Indexing decays the array: the address comes from %rip-relative lea.
  assert!(text.contains("  lea s(%rip), %rax\n"));
  // char store uses the 8-bit register, char load sign-extends.
  assert!(text.contains("  mov %al, (%rdi)\n"));
  assert!(text.contains("  movsbq (%rax), %rax\n"));
}

#[test]
fn while_loop_labels() {
  let text = asm("int main(){ int i; i=0; while(i<10) i=i+1; return i; }");
  assert!(text.contains(".L.begin.1:\n"));
  assert!(text.contains("  jmp .L.begin.1\n.L.end.1:\n"));
  // Comparison materializes a 0/1 and the loop tests it against zero.
  assert!(text.contains(
    "  cmp %rdi, %rax\n  setl %al\n  movzb %al, %rax\n  cmp $0, %rax\n  je  .L.end.1\n"
  ));
}

#[test]
fn two_arg_call() {
  let text = asm("int add(int a, int b){ return a+b; } int main(){ return add(2,3); }");
  // Parameters spill from the SysV argument registers, first at -8.
  assert!(text.contains("add:\n"));
  assert!(text.contains("  mov %rdi, -8(%rbp)\n  mov %rsi, -16(%rbp)\n"));
  // Arguments are pushed left to right and popped back in reverse.
  assert!(text.contains(
    "  mov $2, %rax\n  push %rax\n  mov $3, %rax\n  push %rax\n  pop %rsi\n  pop %rdi\n  mov $0, %rax\n  call add\n"
  ));
  // The callee adds with the rdi/rax discipline.
  assert!(text.contains("  pop %rdi\n  add %rdi, %rax\n"));
}

#[test]
fn if_else_labels_are_paired() {
  let text = asm("int main(){ if (1) return 2; else return 3; }");
  assert!(text.contains("  cmp $0, %rax\n  je  .L.else.1\n"));
  assert!(text.contains("  jmp .L.end.1\n.L.else.1:\n"));
  assert!(text.contains(".L.end.1:\n"));
}

#[test]
fn string_literal_data() {
  let text = asm("int main(){ return \"AB\"[0]; }");
  assert!(text.contains("  .data\n  .globl .L..0\n.L..0:\n  .byte 65\n  .byte 66\n  .byte 0\n"));
  assert!(text.contains("  lea .L..0(%rip), %rax\n"));
}

#[test]
fn negative_init_data_bytes_print_signed() {
  let text = asm("int main(){ return \"\\xff\"[0]; }");
  assert!(text.contains(".L..0:\n  .byte -1\n  .byte 0\n"));
}

#[test]
fn compilation_is_deterministic() {
  let src = "int fib(int n){ if (n<2) return n; return fib(n-1)+fib(n-2); } \
             int main(){ return fib(10); }";
  assert_eq!(asm(src), asm(src));
}

#[test]
fn codegen_is_repeatable_over_one_ast() {
  let arena = Arena::new();
  let mut cc = Compiler::new(&arena, b"int main(){ int i; for (i=0; i<3; i=i+1) i; return i; }");
  tokenize(&mut cc).unwrap();
  let prog = parse(&mut cc).unwrap();
  let first = codegen(&mut cc, &prog).unwrap();
  let second = codegen(&mut cc, &prog).unwrap();
  assert_eq!(first.as_bytes(), second.as_bytes());
}

#[test]
fn add_type_is_idempotent() {
  let arena = Arena::new();
  let mut cc = Compiler::new(
    &arena,
    b"char g[8]; int f(int x){ return x; } int main(){ int *p; p=&g[1]; return f(*p+sizeof g); }",
  );
  tokenize(&mut cc).unwrap();
  let prog = parse(&mut cc).unwrap();

  let before: Vec<_> = cc.nodes.0.iter().map(|n| n.ty).collect();
  for i in 0..cc.nodes.len() {
    add_type(&mut cc, zkcc::parse::NodeId(i as u32)).unwrap();
  }
  let after: Vec<_> = cc.nodes.0.iter().map(|n| n.ty).collect();
  assert_eq!(before, after);

  let _ = codegen(&mut cc, &prog).unwrap();
}

#[test]
fn every_expression_is_typed_before_codegen() {
  let arena = Arena::new();
  let mut cc = Compiler::new(&arena, b"int main(){ int a[2]; a[1]=5; return a[1]-a[0]; }");
  tokenize(&mut cc).unwrap();
  parse(&mut cc).unwrap();
  use zkcc::parse::NodeKind;
  for node in &cc.nodes.0 {
    match node.kind {
      NodeKind::Num(_)
      | NodeKind::Var(_)
      | NodeKind::Binop(..)
      | NodeKind::Neg(_)
      | NodeKind::Addr(_)
      | NodeKind::Deref(_)
      | NodeKind::Assign(..)
      | NodeKind::Funcall { .. } => assert!(node.ty.is_some(), "untyped expression"),
      _ => {}
    }
  }
}

#[test]
fn frame_layout_invariants() {
  let arena = Arena::new();
  let mut cc = Compiler::new(
    &arena,
    b"int main(){ char c; int a; int b[3]; char *p; return 0; }",
  );
  tokenize(&mut cc).unwrap();
  let prog = parse(&mut cc).unwrap();
  let _ = codegen(&mut cc, &prog).unwrap();

  let func = &cc.objs[prog[0]];
  assert_eq!(func.stack_size % 16, 0);
  let mut seen = std::collections::HashSet::new();
  for &var in &func.locals {
    let offset = cc.objs[var].offset;
    assert!(offset < 0);
    assert!(-offset <= func.stack_size);
    assert!(seen.insert(offset), "offsets must be distinct");
  }
  // char c at -1, int a at -9, b[3] ends at -33, p at -41; frame = 48.
  assert_eq!(func.stack_size, 48);
}

#[test]
fn emitted_labels_match_referenced_labels() {
  let text = asm(
    "int main(){ int i; int s; s=0; for (i=0; i<4; i=i+1) { if (i==2) s=s+2; else s=s+1; } \
     while (s>0) s=s-1; return s; }",
  );
  let mut defined = std::collections::BTreeSet::new();
  let mut referenced = std::collections::BTreeSet::new();
  for line in text.lines() {
    let t = line.trim();
    if let Some(label) = t.strip_suffix(':') {
      if label.starts_with(".L.") {
        defined.insert(label.to_string());
      }
    } else if let Some(target) = t.strip_prefix("jmp ").or_else(|| t.strip_prefix("je  ")) {
      referenced.insert(target.trim().to_string());
    }
  }
  assert_eq!(defined, referenced);
}

#[test]
fn arena_exhaustion_fails_the_compile() {
  let arena = Arena::with_limit(200);
  let err = compile(&arena, b"int main(){ return 1+2+3+4+5; }").unwrap_err();
  assert_eq!(err.kind, ErrorKind::Resource);
  assert_eq!(err.msg, "arena exhausted");
}

#[test]
fn caret_report_points_at_the_error() {
  let arena = Arena::new();
  let src = b"int main(){ return x; }";
  let err = compile(&arena, src).unwrap_err();
  assert_eq!(err.kind, ErrorKind::Parse);
  let report = err.report(src);
  let lines: Vec<&str> = report.lines().collect();
  assert_eq!(lines[0], "int main(){ return x; }");
  // The caret sits under the `x` at byte offset 19.
  assert_eq!(err.loc, Some(19));
  assert_eq!(lines[1], format!("{}^ undefined variable", " ".repeat(19)));
}

#[test]
fn chained_comparisons_and_arithmetic() {
  // 8-byte int division and equality materialization.
  let text = asm("int main(){ return (10/3) == 3; }");
  assert!(text.contains("  cqo\n  idiv %rdi\n"));
  assert!(text.contains("  sete %al\n  movzb %al, %rax\n"));
}
