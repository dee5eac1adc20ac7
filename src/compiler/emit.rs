//! Statement emission.
//!
//! Lowers IR statements into a flat label/branch instruction stream.
//! Expressions are carried whole inside instructions; only control flow is
//! made explicit here.

use super::{
    sexpr::SourceSpan,
    tree_il::{Expr, IfClause, Stmt},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug, Clone)]
pub enum Insn {
    Mark(Label),
    Br(Label),
    /// Evaluate the test and branch when it is false.
    BrFalse(Expr, Label),
    Eval(Expr),
    Ret(Expr),
    Position(SourceSpan),
    /// Following instructions have no source position.
    HidePosition,
}

#[derive(Default)]
pub struct CodeGen {
    insns: Vec<Insn>,
    next_label: u32,
}

impl CodeGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn mark_label(&mut self, label: Label) {
        self.insns.push(Insn::Mark(label));
    }

    pub fn emit_branch(&mut self, label: Label) {
        self.insns.push(Insn::Br(label));
    }

    pub fn emit_branch_false(&mut self, test: &Expr, label: Label) {
        self.insns.push(Insn::BrFalse(test.clone(), label));
    }

    pub fn emit_position(&mut self, span: &Option<SourceSpan>) {
        if let Some(span) = span {
            self.insns.push(Insn::Position(span.clone()));
        }
    }

    pub fn emit_sequence_point_none(&mut self) {
        self.insns.push(Insn::HidePosition);
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn finish(self) -> Vec<Insn> {
        self.insns
    }

    pub fn emit_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Block(stmts) => stmts.iter().for_each(|s| self.emit_stmt(s)),
            Stmt::If(clauses, els) => self.emit_if(clauses, els.as_deref()),
            Stmt::Return(e) => self.insns.push(Insn::Ret(e.clone())),
            Stmt::Expression(e) => self.insns.push(Insn::Eval(e.clone())),
        }
    }

    /// Each clause branches past its body when the test is false. Bodies
    /// that can fall through jump to a shared end label, which is only
    /// marked when something jumps to it.
    pub fn emit_if(&mut self, clauses: &[IfClause], els: Option<&Stmt>) {
        let eoi = self.define_label();
        let mut eoi_used = false;

        for clause in clauses {
            let next = self.define_label();
            self.emit_position(&clause.span);
            self.emit_branch_false(&clause.test, next);
            self.emit_stmt(&clause.body);

            if !clause.body.never_falls_through() {
                eoi_used = true;
                // The jump to the end belongs to no source line.
                self.emit_sequence_point_none();
                self.emit_branch(eoi);
            }
            self.mark_label(next);
        }

        if let Some(els) = els {
            self.emit_stmt(els);
        }

        log::trace!(target: "emit", "if with {} clauses, end label used: {}", clauses.len(), eoi_used);

        if eoi_used {
            self.mark_label(eoi);
        }
    }
}

/// Emits a whole procedure body.
pub fn emit(stmt: &Stmt) -> Vec<Insn> {
    let mut gen = CodeGen::new();
    gen.emit_stmt(stmt);
    gen.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::sexpr::Sexpr;

    fn clause(test: bool, body: Stmt) -> IfClause {
        IfClause {
            test: Expr::Constant(Sexpr::Boolean(test)),
            body,
            span: None,
        }
    }

    fn ret(x: i64) -> Stmt {
        Stmt::Return(Expr::Constant(Sexpr::Fixnum(x)))
    }

    fn marks(insns: &[Insn]) -> usize {
        insns.iter().filter(|i| matches!(i, Insn::Mark(_))).count()
    }

    fn branches(insns: &[Insn]) -> usize {
        insns.iter().filter(|i| matches!(i, Insn::Br(_))).count()
    }

    #[test]
    fn returning_clauses_elide_end_label() {
        let stmt = Stmt::If(
            vec![clause(false, ret(1)), clause(true, Stmt::Block(vec![ret(2)]))],
            Some(Box::new(ret(3))),
        );
        let insns = emit(&stmt);
        assert_eq!(branches(&insns), 0);
        assert_eq!(marks(&insns), 2);
    }

    #[test]
    fn falling_clause_marks_end_label() {
        let stmt = Stmt::If(
            vec![
                clause(false, Stmt::Expression(Expr::unspecified())),
                clause(true, ret(2)),
            ],
            None,
        );
        let insns = emit(&stmt);
        assert_eq!(branches(&insns), 1);
        assert_eq!(marks(&insns), 3);
        let Some(Insn::Br(target)) = insns.iter().find(|i| matches!(i, Insn::Br(_))) else {
            panic!("no branch emitted");
        };
        assert!(matches!(insns.last(), Some(Insn::Mark(l)) if l == target));
    }

    #[test]
    fn nested_conditionals_count_as_returning() {
        let inner = Stmt::If(vec![clause(true, ret(1))], Some(Box::new(ret(2))));
        let stmt = Stmt::If(vec![clause(true, inner)], Some(Box::new(ret(3))));
        let insns = emit(&stmt);
        assert_eq!(branches(&insns), 0);
    }

    #[test]
    fn generated_jump_has_no_position() {
        let span = SourceSpan {
            file: "t.scm".into(),
            line: 1,
            column: 2,
        };
        let stmt = Stmt::If(
            vec![
                IfClause {
                    test: Expr::Constant(Sexpr::Boolean(true)),
                    body: ret(1),
                    span: Some(span.clone()),
                },
                IfClause {
                    test: Expr::Constant(Sexpr::Boolean(false)),
                    body: Stmt::Expression(Expr::unspecified()),
                    span: Some(span),
                },
            ],
            None,
        );
        let insns = emit(&stmt);
        assert!(matches!(insns[0], Insn::Position(_)));
        assert!(matches!(insns[1], Insn::BrFalse(..)));
        assert!(matches!(insns[2], Insn::Ret(_)));

        let hidden = insns
            .iter()
            .position(|i| matches!(i, Insn::HidePosition))
            .expect("hidden position");
        assert!(matches!(insns[hidden + 1], Insn::Br(_)));
        assert!(matches!(insns[hidden - 1], Insn::Eval(_)));
        assert_eq!(insns.iter().filter(|i| matches!(i, Insn::HidePosition)).count(), 1);
    }
}
