//! # Parse engine
//!
//! Hand-written recursive-descent parser that emits bytecode directly while
//! parsing — there is no intermediate AST. Grounded on
//! `original_source/m8rscript/ParseEngine.h`'s method shape
//! (`statement`/`expression`/`primaryExpression`/...) and spec §4.3 for the
//! precedence table, short-circuit codegen, label backpatching, switch
//! case/body reordering, for-in desugaring, and upvalue capture discipline.

mod label;

use std::collections::HashMap;

use crate::atom::{shared, Atom, AtomTable};
use crate::bytecode::{
    BinOp, Constant, FunctionId, FunctionProto, Instr, Program, RegOrConst, UnOp, UpvalueDesc,
    GLOBAL_REG, MAX_FUNCTION_INSTRUCTIONS, MAX_REGISTER,
};
use crate::error::{Error, ErrorKind, Location, ParseErrorList};
use crate::scanner::{Scanner, Token, TokenKind};
use label::Label;

type PResult<T> = Result<T, Error>;

#[derive(Clone, Copy)]
struct OpInfo {
    prec: u8,
    right_assoc: bool,
    kind: OpKind,
}

#[derive(Clone, Copy)]
enum OpKind {
    Assign,
    CompoundAssign(BinOp),
    Binary(BinOp),
    LogicalOr,
    LogicalAnd,
}

fn op_info(tok: &TokenKind) -> Option<OpInfo> {
    use OpKind::*;
    use TokenKind::*;
    Some(match tok {
        Char('=') => OpInfo {
            prec: 1,
            right_assoc: true,
            kind: Assign,
        },
        TokenKind::PlusEq => ci(1, true, CompoundAssign(BinOp::Add)),
        TokenKind::MinusEq => ci(1, true, CompoundAssign(BinOp::Sub)),
        TokenKind::StarEq => ci(1, true, CompoundAssign(BinOp::Mul)),
        TokenKind::SlashEq => ci(1, true, CompoundAssign(BinOp::Div)),
        TokenKind::PercentEq => ci(1, true, CompoundAssign(BinOp::Mod)),
        TokenKind::AmpEq => ci(1, true, CompoundAssign(BinOp::And)),
        TokenKind::PipeEq => ci(1, true, CompoundAssign(BinOp::Or)),
        TokenKind::CaretEq => ci(1, true, CompoundAssign(BinOp::Xor)),
        TokenKind::ShlEq => ci(1, true, CompoundAssign(BinOp::Shl)),
        TokenKind::ShrEq => ci(1, true, CompoundAssign(BinOp::Shr)),
        TokenKind::SarEq => ci(1, true, CompoundAssign(BinOp::Sar)),
        TokenKind::OrOr => ci(6, false, LogicalOr),
        TokenKind::AndAnd => ci(7, false, LogicalAnd),
        Char('|') => ci(8, false, Binary(BinOp::Or)),
        Char('^') => ci(9, false, Binary(BinOp::Xor)),
        Char('&') => ci(10, false, Binary(BinOp::And)),
        TokenKind::EqEq => ci(11, false, Binary(BinOp::Eq)),
        TokenKind::NotEq => ci(11, false, Binary(BinOp::Ne)),
        Char('<') => ci(12, false, Binary(BinOp::Lt)),
        Char('>') => ci(12, false, Binary(BinOp::Gt)),
        TokenKind::Le => ci(12, false, Binary(BinOp::Le)),
        TokenKind::Ge => ci(12, false, Binary(BinOp::Ge)),
        TokenKind::Shl => ci(13, false, Binary(BinOp::Shl)),
        TokenKind::Shr => ci(13, false, Binary(BinOp::Shr)),
        TokenKind::Sar => ci(13, false, Binary(BinOp::Sar)),
        Char('+') => ci(14, false, Binary(BinOp::Add)),
        Char('-') => ci(14, false, Binary(BinOp::Sub)),
        Char('*') => ci(15, false, Binary(BinOp::Mul)),
        Char('/') => ci(15, false, Binary(BinOp::Div)),
        Char('%') => ci(15, false, Binary(BinOp::Mod)),
        _ => return None,
    })
}

fn ci(prec: u8, right_assoc: bool, kind: OpKind) -> OpInfo {
    OpInfo {
        prec,
        right_assoc,
        kind,
    }
}

/// An l-value produced by postfix parsing. Reading bakes it into an
/// r-value; writing performs the appropriate store opcode. Never persists
/// across a statement boundary (spec §3 Invariants).
enum Place {
    Local(u8),
    Upvalue(u16),
    Prop(u8, Atom),
    Elt(u8, RegOrConst),
    Value(RegOrConst),
}

struct FunctionEntry {
    id: FunctionId,
    proto: FunctionProto,
    locals_index: HashMap<Atom, u16>,
    /// Offset above `locals.len()` for the next temp register; reset to 0
    /// at each statement boundary (temps never outlive their statement).
    temp_mark: u16,
    max_temp_offset: u16,
    break_stack: Vec<Vec<Label>>,
    continue_stack: Vec<Vec<Label>>,
}

impl FunctionEntry {
    fn new(id: FunctionId) -> Self {
        FunctionEntry {
            id,
            proto: FunctionProto::default(),
            locals_index: HashMap::new(),
            temp_mark: 0,
            max_temp_offset: 0,
            break_stack: Vec::new(),
            continue_stack: Vec::new(),
        }
    }
}

pub struct Parser<'a> {
    scanner: Scanner<'a>,
    atoms: &'a mut AtomTable,
    token: Token,
    functions: Vec<FunctionEntry>,
    finished: Vec<FunctionProto>,
    strings: Vec<String>,
    errors: ParseErrorList,
    next_label_id: u32,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str, atoms: &'a mut AtomTable) -> PResult<Self> {
        let mut scanner = Scanner::new(src);
        let token = scanner.get_token()?;
        Ok(Parser {
            scanner,
            atoms,
            token,
            functions: Vec::new(),
            finished: Vec::new(),
            strings: Vec::new(),
            errors: ParseErrorList::new(),
            next_label_id: 0,
        })
    }

    /// Parse a whole program, returning the finished [`Program`] plus any
    /// accumulated (non-fatal) parse errors. An empty source is a valid
    /// empty program (spec §8 boundary behaviour).
    pub fn parse_program(mut self) -> (Option<Program>, ParseErrorList) {
        let root_id = self.start_function();
        while !self.at_eof() {
            if let Err(e) = self.statement() {
                self.errors.push(e);
                self.recover();
            }
        }
        self.end_function(root_id, 0);
        if !self.errors.is_empty() {
            return (None, self.errors);
        }
        let program = Program {
            functions: self.finished,
            strings: self.strings,
            root: root_id,
        };
        (Some(program), self.errors)
    }

    // ---- token plumbing -------------------------------------------------

    fn at_eof(&self) -> bool {
        self.token.kind == TokenKind::Eof
    }

    fn loc(&self) -> Location {
        self.token.loc
    }

    fn advance(&mut self) -> PResult<()> {
        self.token = self.scanner.get_token()?;
        Ok(())
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.token.kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> PResult<bool> {
        if self.check(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<()> {
        if self.check(&kind) {
            self.advance()
        } else {
            Err(Error::Syntax(
                format!("expected {:?}, found {:?}", kind, self.token.kind),
                self.loc(),
            ))
        }
    }

    fn expect_identifier(&mut self) -> PResult<Atom> {
        match self.token.kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance()?;
                Ok(self.atoms.atomize(&name))
            }
            _ => Err(Error::Syntax(
                format!("expected identifier, found {:?}", self.token.kind),
                self.loc(),
            )),
        }
    }

    /// Skip tokens until the next statement boundary (`;`, `}`, or EOF), so
    /// a single parse error doesn't stop the whole compile (spec §4.3).
    fn recover(&mut self) {
        loop {
            match self.token.kind {
                TokenKind::Eof => return,
                TokenKind::Char(';') => {
                    let _ = self.advance();
                    return;
                }
                TokenKind::Char('}') => return,
                _ => {
                    if self.advance().is_err() {
                        return;
                    }
                }
            }
        }
    }

    // ---- function / register bookkeeping --------------------------------

    fn cur(&self) -> &FunctionEntry {
        self.functions.last().expect("no active function")
    }

    fn cur_mut(&mut self) -> &mut FunctionEntry {
        self.functions.last_mut().expect("no active function")
    }

    fn start_function(&mut self) -> FunctionId {
        let id = self.finished.len() as FunctionId;
        self.finished.push(FunctionProto::default());
        self.functions.push(FunctionEntry::new(id));
        id
    }

    fn end_function(&mut self, id: FunctionId, formal_param_count: u8) {
        let entry = self.functions.pop().expect("function stack underflow");
        let mut proto = entry.proto;
        proto.formal_param_count = formal_param_count;
        proto.temp_registers = entry.max_temp_offset.min(255) as u8;
        self.finished[id as usize] = proto;
    }

    fn emit(&mut self, instr: Instr) -> usize {
        let idx = {
            let entry = self.cur_mut();
            entry.proto.code.push(instr);
            entry.proto.code.len() - 1
        };
        if idx + 1 > MAX_FUNCTION_INSTRUCTIONS {
            self.errors.push(
                ErrorKind::CodeSizeExceeded
                    .into_error("function exceeds maximum instruction count".into()),
            );
        }
        idx
    }

    fn code_len(&self) -> usize {
        self.cur().proto.code.len()
    }

    fn alloc_temp(&mut self) -> PResult<u8> {
        let entry = self.cur_mut();
        let reg = entry.locals_index.len() as u16 + entry.temp_mark;
        if reg >= MAX_REGISTER {
            return Err(Error::Semantic(
                "too many registers in function".into(),
                Location::default(),
            ));
        }
        entry.temp_mark += 1;
        entry.max_temp_offset = entry.max_temp_offset.max(entry.temp_mark);
        Ok(reg as u8)
    }

    fn end_statement(&mut self) {
        self.cur_mut().temp_mark = 0;
    }

    fn add_var(&mut self, name: Atom) -> u8 {
        let entry = self.cur_mut();
        if let Some(&slot) = entry.locals_index.get(&name) {
            return slot as u8;
        }
        let slot = entry.locals_index.len() as u16;
        entry.locals_index.insert(name, slot);
        entry.proto.locals.push(name);
        slot as u8
    }

    fn const_index(&mut self, c: Constant) -> u16 {
        let entry = self.cur_mut();
        // Linear-scan dedup; per-function pools are small on embedded targets.
        for (i, existing) in entry.proto.constants.iter().enumerate() {
            let same = match (existing, &c) {
                (Constant::Integer(a), Constant::Integer(b)) => a == b,
                (Constant::Float(a), Constant::Float(b)) => a == b,
                (Constant::StringLiteral(a), Constant::StringLiteral(b)) => a == b,
                (Constant::Atom(a), Constant::Atom(b)) => a == b,
                (Constant::Function(a), Constant::Function(b)) => a == b,
                _ => false,
            };
            if same {
                return i as u16;
            }
        }
        entry.proto.constants.push(c);
        (entry.proto.constants.len() - 1) as u16
    }

    fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(pos) = self.strings.iter().position(|e| e == s) {
            return pos as u32;
        }
        self.strings.push(s.to_string());
        (self.strings.len() - 1) as u32
    }

    fn const_string(&mut self, s: &str) -> u16 {
        let idx = self.intern_string(s);
        self.const_index(Constant::StringLiteral(idx))
    }

    fn const_integer(&mut self, v: i32) -> u16 {
        self.const_index(Constant::Integer(v))
    }

    fn const_float(&mut self, v: f64) -> u16 {
        self.const_index(Constant::Float(v))
    }

    // ---- jumps & labels ---------------------------------------------------

    fn new_label(&mut self) -> u32 {
        self.next_label_id += 1;
        self.next_label_id
    }

    fn emit_jump(&mut self, make: impl FnOnce(i32) -> Instr) -> Label {
        let id = self.new_label();
        let idx = self.emit(make(0));
        Label {
            instr_index: idx,
            id,
        }
    }

    /// Patch a previously emitted jump so it targets the current code
    /// position (spec §4.3 `matchJump`).
    fn patch_jump(&mut self, label: Label) {
        let target = self.code_len() as i32;
        let from = label.instr_index as i32;
        let offset = target - (from + 1);
        let entry = self.cur_mut();
        match &mut entry.proto.code[label.instr_index] {
            Instr::Jmp { offset: o } => *o = offset,
            Instr::Jt { offset: o, .. } => *o = offset,
            Instr::Jf { offset: o, .. } => *o = offset,
            Instr::CaseTest { offset: o, .. } => *o = offset,
            other => panic!("patch_jump on non-jump instruction {:?}", other),
        }
    }

    /// Patch `label` to target an already-known address instead of "here".
    fn patch_jump_to(&mut self, label: Label, target: usize) {
        let offset = target as i32 - (label.instr_index as i32 + 1);
        let entry = self.cur_mut();
        match &mut entry.proto.code[label.instr_index] {
            Instr::Jmp { offset: o } => *o = offset,
            Instr::Jt { offset: o, .. } => *o = offset,
            Instr::Jf { offset: o, .. } => *o = offset,
            Instr::CaseTest { offset: o, .. } => *o = offset,
            other => panic!("patch_jump_to on non-jump instruction {:?}", other),
        }
    }

    // ---- variable resolution & upvalue capture ---------------------------

    fn resolve(&mut self, name: Atom) -> Place {
        let top = self.functions.len() - 1;
        if let Some(&slot) = self.functions[top].locals_index.get(&name) {
            return Place::Local(slot as u8);
        }
        if let Some(idx) = self.resolve_upvalue(top, name) {
            return Place::Upvalue(idx);
        }
        Place::Prop(GLOBAL_REG, name)
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: Atom) -> Option<u16> {
        if func_idx == 0 {
            return None;
        }
        let parent = func_idx - 1;
        if let Some(&slot) = self.functions[parent].locals_index.get(&name) {
            return Some(self.add_upvalue(func_idx, 0, slot, name));
        }
        if let Some(up_idx) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(func_idx, 1, up_idx, name));
        }
        None
    }

    fn add_upvalue(&mut self, func_idx: usize, outer_frame_distance: u8, index_in_outer: u16, name: Atom) -> u16 {
        let ups = &mut self.functions[func_idx].proto.upvalues;
        for (i, u) in ups.iter().enumerate() {
            if u.outer_frame_distance == outer_frame_distance && u.index_in_outer == index_in_outer {
                return i as u16;
            }
        }
        ups.push(UpvalueDesc {
            outer_frame_distance,
            index_in_outer,
            name,
        });
        (ups.len() - 1) as u16
    }

    // ---- place read/write --------------------------------------------------

    fn read_place(&mut self, place: Place) -> PResult<RegOrConst> {
        Ok(match place {
            Place::Local(r) => RegOrConst::Reg(r),
            Place::Value(v) => v,
            Place::Upvalue(idx) => {
                let dst = self.alloc_temp()?;
                self.emit(Instr::LoadUp { dst, idx });
                RegOrConst::Reg(dst)
            }
            Place::Prop(obj, key) => {
                let dst = self.alloc_temp()?;
                self.emit(Instr::LoadProp {
                    dst,
                    obj: RegOrConst::Reg(obj),
                    key,
                });
                RegOrConst::Reg(dst)
            }
            Place::Elt(obj, idx) => {
                let dst = self.alloc_temp()?;
                self.emit(Instr::LoadElt {
                    dst,
                    obj: RegOrConst::Reg(obj),
                    idx,
                });
                RegOrConst::Reg(dst)
            }
        })
    }

    fn write_place(&mut self, place: Place, val: RegOrConst) -> PResult<RegOrConst> {
        match place {
            Place::Local(r) => {
                self.emit(Instr::Move { dst: r, src: val });
                Ok(RegOrConst::Reg(r))
            }
            Place::Upvalue(idx) => {
                self.emit(Instr::StoreUp { idx, val });
                Ok(val)
            }
            Place::Prop(obj, key) => {
                self.emit(Instr::StoProp {
                    obj: RegOrConst::Reg(obj),
                    key,
                    val,
                });
                Ok(val)
            }
            Place::Elt(obj, idx) => {
                self.emit(Instr::StoElt {
                    obj: RegOrConst::Reg(obj),
                    idx,
                    val,
                });
                Ok(val)
            }
            Place::Value(_) => Err(Error::Syntax("invalid assignment target".into(), self.loc())),
        }
    }

    // ---- statements ---------------------------------------------------------

    fn statement(&mut self) -> PResult<()> {
        let result = match &self.token.kind {
            TokenKind::Function => self.function_stmt(),
            TokenKind::Class => self.class_stmt(),
            TokenKind::Char('{') => self.compound_stmt(),
            TokenKind::If => self.if_stmt(),
            TokenKind::Switch => self.switch_stmt(),
            TokenKind::While | TokenKind::Do | TokenKind::For => self.iteration_stmt(),
            TokenKind::Break | TokenKind::Continue | TokenKind::Return => self.jump_stmt(),
            TokenKind::Var => self.var_stmt(),
            _ => self.expr_stmt(),
        };
        self.end_statement();
        result
    }

    fn compound_stmt(&mut self) -> PResult<()> {
        self.expect(TokenKind::Char('{'))?;
        while !self.check(&TokenKind::Char('}')) && !self.at_eof() {
            if let Err(e) = self.statement() {
                self.errors.push(e);
                self.recover();
            }
        }
        self.expect(TokenKind::Char('}'))
    }

    fn var_stmt(&mut self) -> PResult<()> {
        self.advance()?; // 'var'
        self.variable_declaration_list()?;
        self.eat(&TokenKind::Char(';'))?;
        Ok(())
    }

    fn variable_declaration_list(&mut self) -> PResult<()> {
        loop {
            self.variable_declaration()?;
            if !self.eat(&TokenKind::Char(','))? {
                break;
            }
        }
        Ok(())
    }

    /// Returns the declared variable's register slot.
    fn variable_declaration(&mut self) -> PResult<u8> {
        let name = self.expect_identifier()?;
        let slot = self.add_var(name);
        if self.eat(&TokenKind::Char('='))? {
            let val = self.arith_expr(1)?;
            self.emit(Instr::Move { dst: slot, src: val });
        }
        Ok(slot)
    }

    fn expr_stmt(&mut self) -> PResult<()> {
        self.expr()?;
        self.eat(&TokenKind::Char(';'))?;
        Ok(())
    }

    fn if_stmt(&mut self) -> PResult<()> {
        self.advance()?; // 'if'
        self.expect(TokenKind::Char('('))?;
        let cond = self.expr()?;
        self.expect(TokenKind::Char(')'))?;
        let cond_reg = self.to_reg(cond)?;
        let jf = self.emit_jump(|offset| Instr::Jf {
            cond: cond_reg,
            offset,
        });
        self.statement()?;
        if self.eat(&TokenKind::Else)? {
            let jmp_end = self.emit_jump(|offset| Instr::Jmp { offset });
            self.patch_jump(jf);
            self.statement()?;
            self.patch_jump(jmp_end);
        } else {
            self.patch_jump(jf);
        }
        Ok(())
    }

    fn iteration_stmt(&mut self) -> PResult<()> {
        match self.token.kind {
            TokenKind::While => self.while_stmt(),
            TokenKind::Do => self.do_while_stmt(),
            TokenKind::For => self.for_stmt(),
            _ => unreachable!(),
        }
    }

    fn while_stmt(&mut self) -> PResult<()> {
        self.advance()?;
        self.expect(TokenKind::Char('('))?;
        let top = self.code_len();
        let cond = self.expr()?;
        self.expect(TokenKind::Char(')'))?;
        let cond_reg = self.to_reg(cond)?;
        let jf_exit = self.emit_jump(|offset| Instr::Jf {
            cond: cond_reg,
            offset,
        });
        self.cur_mut().break_stack.push(Vec::new());
        self.cur_mut().continue_stack.push(Vec::new());
        self.statement()?;
        let continue_target = self.code_len();
        self.emit_jump_back(top);
        self.patch_jump(jf_exit);
        self.finish_loop(continue_target);
        Ok(())
    }

    fn do_while_stmt(&mut self) -> PResult<()> {
        self.advance()?; // 'do'
        self.cur_mut().break_stack.push(Vec::new());
        self.cur_mut().continue_stack.push(Vec::new());
        let top = self.code_len();
        self.statement()?;
        self.expect(TokenKind::While)?;
        self.expect(TokenKind::Char('('))?;
        let continue_target = self.code_len();
        let cond = self.expr()?;
        self.expect(TokenKind::Char(')'))?;
        self.eat(&TokenKind::Char(';'))?;
        let cond_reg = self.to_reg(cond)?;
        let back_offset = top as i32 - (self.code_len() as i32 + 1);
        self.emit(Instr::Jt {
            cond: cond_reg,
            offset: back_offset,
        });
        self.finish_loop(continue_target);
        Ok(())
    }

    fn for_stmt(&mut self) -> PResult<()> {
        self.advance()?; // 'for'
        self.expect(TokenKind::Char('('))?;

        // Disambiguate `for (var x : obj)` (for-in) from the 3-clause form by
        // scanning ahead after an optional `var` + identifier.
        let has_var = self.eat(&TokenKind::Var)?;
        if has_var {
            if let TokenKind::Identifier(name) = self.token.kind.clone() {
                let save_name = name;
                self.advance()?;
                if self.check(&TokenKind::Char(':')) {
                    self.advance()?;
                    let atom = self.atoms.atomize(&save_name);
                    return self.for_in_stmt(atom);
                }
                // Not for-in: replay as a normal var declaration list.
                let atom = self.atoms.atomize(&save_name);
                let slot = self.add_var(atom);
                if self.eat(&TokenKind::Char('='))? {
                    let v = self.arith_expr(1)?;
                    self.emit(Instr::Move { dst: slot, src: v });
                }
                if self.eat(&TokenKind::Char(','))? {
                    self.variable_declaration_list()?;
                }
            } else {
                return Err(Error::Syntax("expected identifier after 'var'".into(), self.loc()));
            }
        } else if !self.check(&TokenKind::Char(';')) {
            // `for (expr : expr)` without `var`, or classic `expr; expr; expr`.
            let first = self.expr()?;
            if self.check(&TokenKind::Char(':')) {
                self.advance()?;
                // Only a bare identifier target is supported for sugar-free for-in.
                if let RegOrConst::Reg(r) = first {
                    return self.for_in_stmt_reg(r);
                }
                return Err(Error::Syntax(
                    "for-in target must be an identifier".into(),
                    self.loc(),
                ));
            }
            self.eat(&TokenKind::Char(';'))?;
            return self.for_classic_rest();
        }
        self.expect(TokenKind::Char(';'))?;
        self.for_classic_rest()
    }

    /// Parses `cond ';' increment ')' stmt` — the tail shared by both
    /// `for (var ...; ; )` and `for (expr; ; )` once the init clause is done.
    /// The increment clause is emitted where it's parsed (right after the
    /// condition) and reached via jumps: a `jmp` over it the first time
    /// through, a `jmp` back to the condition after it, so it still runs
    /// after the body on every iteration without needing any buffering.
    fn for_classic_rest(&mut self) -> PResult<()> {
        let cond_top = self.code_len();
        let has_cond = !self.check(&TokenKind::Char(';'));
        let jf_exit = if has_cond {
            let cond = self.expr()?;
            let cond_reg = self.to_reg(cond)?;
            Some(self.emit_jump(|offset| Instr::Jf {
                cond: cond_reg,
                offset,
            }))
        } else {
            None
        };
        self.expect(TokenKind::Char(';'))?;

        // The increment clause is parsed now but must execute *after* the
        // body, so we record its source text position is not reusable with
        // our streaming scanner; instead we buffer it as a deferred code
        // segment the way the parser buffers switch case bodies.
        let body_jump = self.emit_jump(|offset| Instr::Jmp { offset });
        let inc_start = self.code_len();
        if !self.check(&TokenKind::Char(')')) {
            self.expr()?;
        }
        self.expect(TokenKind::Char(')'))?;
        let back_to_cond = cond_top as i32 - (self.code_len() as i32 + 1);
        self.emit(Instr::Jmp {
            offset: back_to_cond,
        });
        self.patch_jump(body_jump);

        self.cur_mut().break_stack.push(Vec::new());
        self.cur_mut().continue_stack.push(Vec::new());
        self.statement()?;
        let continue_target = inc_start;
        let back_to_inc = continue_target as i32 - (self.code_len() as i32 + 1);
        self.emit(Instr::Jmp {
            offset: back_to_inc,
        });

        let exit_addr = self.code_len();
        if let Some(jf) = jf_exit {
            self.patch_jump_to(jf, exit_addr);
        }
        self.finish_loop(continue_target);
        Ok(())
    }

    fn for_in_stmt(&mut self, iter_var: Atom) -> PResult<()> {
        let slot = self.add_var(iter_var);
        self.for_in_common(slot)
    }

    fn for_in_stmt_reg(&mut self, reg: u8) -> PResult<()> {
        self.for_in_common(reg)
    }

    /// `for (var it : obj) body` desugars to:
    /// `it = new obj.iterator(obj); while (!it.done()) { body; it.next(); }`
    fn for_in_common(&mut self, it_slot: u8) -> PResult<()> {
        let obj = self.arith_expr(1)?;
        self.expect(TokenKind::Char(')'))?;
        let obj_reg = self.to_reg(obj)?;

        let iterator_fn = self.alloc_temp()?;
        self.emit(Instr::LoadProp {
            dst: iterator_fn,
            obj: RegOrConst::Reg(obj_reg),
            key: shared::ITERATOR,
        });
        self.emit(Instr::Dup {
            dst: it_slot,
            src: iterator_fn,
        });
        self.emit(Instr::New {
            callee: it_slot,
            nparams: 0,
        });

        let loop_top = self.code_len();
        let done_fn = self.alloc_temp()?;
        self.emit(Instr::LoadProp {
            dst: done_fn,
            obj: RegOrConst::Reg(it_slot),
            key: shared::DONE,
        });
        self.emit(Instr::Call {
            callee: done_fn,
            nparams: 0,
        });
        let not_done = self.alloc_temp()?;
        self.emit(Instr::UnOp {
            op: UnOp::UNot,
            dst: not_done,
            src: RegOrConst::Reg(done_fn),
        });
        let jf_exit = self.emit_jump(|offset| Instr::Jf {
            cond: not_done,
            offset,
        });

        self.cur_mut().break_stack.push(Vec::new());
        self.cur_mut().continue_stack.push(Vec::new());
        self.statement()?;

        let continue_target = self.code_len();
        let next_fn = self.alloc_temp()?;
        self.emit(Instr::LoadProp {
            dst: next_fn,
            obj: RegOrConst::Reg(it_slot),
            key: shared::NEXT,
        });
        self.emit(Instr::Call {
            callee: next_fn,
            nparams: 0,
        });
        let back = loop_top as i32 - (self.code_len() as i32 + 1);
        self.emit(Instr::Jmp { offset: back });
        self.patch_jump(jf_exit);
        self.finish_loop(continue_target);
        Ok(())
    }

    fn finish_loop(&mut self, continue_target: usize) {
        let exit = self.code_len();
        let continues = self.cur_mut().continue_stack.pop().unwrap_or_default();
        for label in continues {
            self.patch_jump_to(label, continue_target);
        }
        let breaks = self.cur_mut().break_stack.pop().unwrap_or_default();
        for label in breaks {
            self.patch_jump_to(label, exit);
        }
    }

    fn jump_stmt(&mut self) -> PResult<()> {
        match self.token.kind {
            TokenKind::Break => {
                self.advance()?;
                self.eat(&TokenKind::Char(';'))?;
                let label = self.emit_jump(|offset| Instr::Jmp { offset });
                match self.cur_mut().break_stack.last_mut() {
                    Some(stack) => stack.push(label),
                    None => return Err(Error::Syntax("'break' outside loop/switch".into(), self.loc())),
                }
                Ok(())
            }
            TokenKind::Continue => {
                self.advance()?;
                self.eat(&TokenKind::Char(';'))?;
                let label = self.emit_jump(|offset| Instr::Jmp { offset });
                match self.cur_mut().continue_stack.last_mut() {
                    Some(stack) => stack.push(label),
                    None => return Err(Error::Syntax("'continue' outside loop".into(), self.loc())),
                }
                Ok(())
            }
            TokenKind::Return => {
                self.advance()?;
                if self.eat(&TokenKind::Char(';'))? {
                    self.emit(Instr::Ret { nvalues: 0 });
                    return Ok(());
                }
                let v = self.expr()?;
                let reg = self.to_reg(v)?;
                if reg != 0 {
                    self.emit(Instr::Move { dst: 0, src: RegOrConst::Reg(reg) });
                }
                self.eat(&TokenKind::Char(';'))?;
                self.emit(Instr::Ret { nvalues: 1 });
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    /// Case/body reordering via a deferred buffer (spec §4.3): each case's
    /// body is parsed into its own scratch `Vec<Instr>`, then all bodies are
    /// concatenated after every `CaseTest` so tests stay contiguous.
    fn switch_stmt(&mut self) -> PResult<()> {
        self.advance()?; // 'switch'
        self.expect(TokenKind::Char('('))?;
        let subject = self.expr()?;
        self.expect(TokenKind::Char(')'))?;
        let subject_reg = self.to_reg(subject)?;
        self.expect(TokenKind::Char('{'))?;

        self.cur_mut().break_stack.push(Vec::new());

        struct Case {
            test: Option<RegOrConst>, // None = default
            body: Vec<Instr>,
        }
        let mut cases: Vec<Case> = Vec::new();
        let mut seen_default = false;

        while !self.check(&TokenKind::Char('}')) && !self.at_eof() {
            let test = if self.eat(&TokenKind::Case)? {
                let t = self.arith_expr(1)?;
                self.expect(TokenKind::Char(':'))?;
                Some(t)
            } else if self.eat(&TokenKind::Default)? {
                if seen_default {
                    return Err(Error::Syntax(
                        "multiple default cases not allowed".into(),
                        self.loc(),
                    ));
                }
                seen_default = true;
                self.expect(TokenKind::Char(':'))?;
                None
            } else {
                return Err(Error::Syntax("expected 'case' or 'default'".into(), self.loc()));
            };

            // Parse this case's body statements into a scratch buffer by
            // temporarily swapping it in for the function's code vector.
            let saved = std::mem::take(&mut self.cur_mut().proto.code);
            while !self.check(&TokenKind::Case)
                && !self.check(&TokenKind::Default)
                && !self.check(&TokenKind::Char('}'))
                && !self.at_eof()
            {
                if let Err(e) = self.statement() {
                    self.errors.push(e);
                    self.recover();
                }
            }
            let body = std::mem::replace(&mut self.cur_mut().proto.code, saved);
            cases.push(Case { test, body });
        }
        self.expect(TokenKind::Char('}'))?;

        // Emit: test1,jt1 .. testN,jtN, [jmp default-or-end], then bodies.
        let mut body_start_placeholder = Vec::new();
        let mut test_jumps = Vec::new();
        for case in &cases {
            if let Some(test) = case.test {
                let label = self.emit_jump(|offset| Instr::CaseTest {
                    val: subject_reg,
                    case: test,
                    offset,
                });
                test_jumps.push(Some(label));
            } else {
                test_jumps.push(None);
            }
        }
        let default_idx = cases.iter().position(|c| c.test.is_none());
        let fallthrough_to_end = self.emit_jump(|offset| Instr::Jmp { offset });

        for (i, case) in cases.iter().enumerate() {
            let start = self.code_len();
            body_start_placeholder.push(start);
            let entry = self.cur_mut();
            entry.proto.code.extend_from_slice(&case.body);
            if let Some(label) = test_jumps[i] {
                self.patch_jump_to(label, start);
            }
        }
        let end_addr = self.code_len();
        if let Some(di) = default_idx {
            self.patch_jump_to(fallthrough_to_end, body_start_placeholder[di]);
        } else {
            self.patch_jump_to(fallthrough_to_end, end_addr);
        }

        let breaks = self.cur_mut().break_stack.pop().unwrap_or_default();
        for label in breaks {
            self.patch_jump_to(label, end_addr);
        }
        Ok(())
    }

    fn function_stmt(&mut self) -> PResult<()> {
        self.advance()?; // 'function'
        let name = self.expect_identifier()?;
        let slot = self.add_var(name);
        let func_reg = self.function_literal(Some(name))?;
        self.emit(Instr::Move {
            dst: slot,
            src: RegOrConst::Reg(func_reg),
        });
        Ok(())
    }

    /// `class Name { constructor(args) { body } methods... }` desugars to a
    /// constructor function whose body builds an object literal, runs the
    /// constructor body with `this` bound to it, and attaches methods as
    /// properties (spec §4.3 supplement, grounded on
    /// `original_source/ParseEngine.h`'s `statement` production).
    fn class_stmt(&mut self) -> PResult<()> {
        self.advance()?; // 'class'
        let name = self.expect_identifier()?;
        let class_slot = self.add_var(name);
        self.expect(TokenKind::Char('{'))?;

        let ctor_id = self.start_function();
        let this_reg: u8 = 0;
        self.cur_mut().locals_index.insert(shared::THIS, 0);
        self.cur_mut().proto.locals.push(shared::THIS);
        self.emit(Instr::LoadLitO { dst: this_reg });

        let mut formal_count: u8 = 0;
        while !self.check(&TokenKind::Char('}')) && !self.at_eof() {
            if self.eat(&TokenKind::Constructor)? {
                self.expect(TokenKind::Char('('))?;
                formal_count = self.formal_parameter_list_into_current()?;
                self.expect(TokenKind::Char(')'))?;
                self.compound_stmt()?;
            } else {
                let method_name = self.expect_identifier()?;
                let method_reg = self.function_literal(Some(method_name))?;
                self.emit(Instr::StoProp {
                    obj: RegOrConst::Reg(this_reg),
                    key: method_name,
                    val: RegOrConst::Reg(method_reg),
                });
            }
        }
        self.expect(TokenKind::Char('}'))?;
        // `this` already lives in register 0, which doubles as the return
        // value register by convention, so no final move is needed.
        self.emit(Instr::Ret { nvalues: 1 });
        self.end_function(ctor_id, formal_count);

        let func_const = self.const_index(Constant::Function(ctor_id));
        let dst = self.alloc_temp()?;
        self.emit(Instr::Closure {
            dst,
            func_const,
        });
        self.emit(Instr::Move {
            dst: class_slot,
            src: RegOrConst::Reg(dst),
        });
        Ok(())
    }

    /// Parses `(a, b, c)`'s contents directly into the *currently active*
    /// function entry's locals (used right after `start_function`).
    fn formal_parameter_list_into_current(&mut self) -> PResult<u8> {
        let mut count = 0u8;
        if self.check(&TokenKind::Char(')')) {
            return Ok(0);
        }
        loop {
            let name = self.expect_identifier()?;
            self.add_var(name);
            count += 1;
            if !self.eat(&TokenKind::Char(','))? {
                break;
            }
        }
        Ok(count)
    }

    // ---- expressions ---------------------------------------------------------

    fn expr(&mut self) -> PResult<RegOrConst> {
        let mut v = self.arith_expr(1)?;
        while self.check(&TokenKind::Char(',')) {
            self.advance()?;
            v = self.arith_expr(1)?;
        }
        Ok(v)
    }

    fn to_reg(&mut self, v: RegOrConst) -> PResult<u8> {
        match v {
            RegOrConst::Reg(r) => Ok(r),
            RegOrConst::Const(k) => {
                let dst = self.alloc_temp()?;
                self.emit(Instr::LoadRefK { dst, konst: k });
                Ok(dst)
            }
        }
    }

    /// Precedence climbing with `min_prec`, plus the ternary special case
    /// parsed "between unary and binary stages" (spec §4.3).
    fn arith_expr(&mut self, min_prec: u8) -> PResult<RegOrConst> {
        let place = self.unary()?;
        let mut lhs = self.read_place_or_assign(place, min_prec)?;

        if self.check(&TokenKind::Char('?')) {
            self.advance()?;
            let lhs_reg = self.to_reg(lhs)?;
            let jf = self.emit_jump(|offset| Instr::Jf {
                cond: lhs_reg,
                offset,
            });
            let then_v = self.expr()?;
            let dst = self.alloc_temp()?;
            self.emit(Instr::Move { dst, src: then_v });
            let jmp_end = self.emit_jump(|offset| Instr::Jmp { offset });
            self.expect(TokenKind::Char(':'))?;
            self.patch_jump(jf);
            let else_v = self.arith_expr(1)?;
            self.emit(Instr::Move { dst, src: else_v });
            self.patch_jump(jmp_end);
            return Ok(RegOrConst::Reg(dst));
        }

        loop {
            let info = match op_info(&self.token.kind) {
                Some(info) if info.prec >= min_prec => info,
                _ => break,
            };
            // Assignment operators are only handled via `read_place_or_assign`
            // above on the *first* operand; once we're folding left-to-right
            // through `lhs` as a plain r-value, only the non-assigning kinds
            // apply.
            match info.kind {
                OpKind::Assign | OpKind::CompoundAssign(_) => break,
                OpKind::LogicalOr => {
                    self.advance()?;
                    lhs = self.short_circuit(lhs, true, info.prec + 1)?;
                }
                OpKind::LogicalAnd => {
                    self.advance()?;
                    lhs = self.short_circuit(lhs, false, info.prec + 1)?;
                }
                OpKind::Binary(op) => {
                    self.advance()?;
                    let next_min = if info.right_assoc {
                        info.prec
                    } else {
                        info.prec + 1
                    };
                    let rhs = self.arith_expr(next_min)?;
                    let dst = self.alloc_temp()?;
                    self.emit(Instr::BinOp {
                        op,
                        dst,
                        lhs,
                        rhs,
                    });
                    lhs = RegOrConst::Reg(dst);
                }
            }
        }
        Ok(lhs)
    }

    /// Handles assignment/compound-assignment when the left operand, still
    /// in `Place` form, is immediately followed by `=`/`+=`/etc; otherwise
    /// bakes the place into a plain r-value and falls through to the
    /// ordinary binary-operator loop.
    fn read_place_or_assign(&mut self, place: Place, min_prec: u8) -> PResult<RegOrConst> {
        if min_prec <= 1 {
            if let Some(info) = op_info(&self.token.kind) {
                match info.kind {
                    OpKind::Assign => {
                        self.advance()?;
                        let rhs = self.arith_expr(1)?;
                        return self.write_place(place, rhs);
                    }
                    OpKind::CompoundAssign(op) => {
                        self.advance()?;
                        let current = self.read_place_dup(&place)?;
                        let rhs = self.arith_expr(1)?;
                        let dst = self.alloc_temp()?;
                        self.emit(Instr::BinOp {
                            op,
                            dst,
                            lhs: current,
                            rhs,
                        });
                        return self.write_place(place, RegOrConst::Reg(dst));
                    }
                    _ => {}
                }
            }
        }
        self.read_place(place)
    }

    /// Reads a place's current value without consuming it (the place is
    /// still needed afterward to perform the compound-assignment store).
    fn read_place_dup(&mut self, place: &Place) -> PResult<RegOrConst> {
        match *place {
            Place::Local(r) => Ok(RegOrConst::Reg(r)),
            Place::Value(v) => Ok(v),
            Place::Upvalue(idx) => {
                let dst = self.alloc_temp()?;
                self.emit(Instr::LoadUp { dst, idx });
                Ok(RegOrConst::Reg(dst))
            }
            Place::Prop(obj, key) => {
                let dst = self.alloc_temp()?;
                self.emit(Instr::LoadProp {
                    dst,
                    obj: RegOrConst::Reg(obj),
                    key,
                });
                Ok(RegOrConst::Reg(dst))
            }
            Place::Elt(obj, idx) => {
                let dst = self.alloc_temp()?;
                self.emit(Instr::LoadElt {
                    dst,
                    obj: RegOrConst::Reg(obj),
                    idx,
                });
                Ok(RegOrConst::Reg(dst))
            }
        }
    }

    /// Short-circuit `&&`/`||` codegen (spec §4.3): jump over the RHS and
    /// load the short-circuit constant before falling through to the
    /// long-form path.
    fn short_circuit(&mut self, lhs: RegOrConst, is_or: bool, rhs_min_prec: u8) -> PResult<RegOrConst> {
        let lhs_reg = self.to_reg(lhs)?;
        let dst = self.alloc_temp()?;
        let short_circuit_jump = if is_or {
            self.emit_jump(|offset| Instr::Jt {
                cond: lhs_reg,
                offset,
            })
        } else {
            self.emit_jump(|offset| Instr::Jf {
                cond: lhs_reg,
                offset,
            })
        };
        // Long form: evaluate RHS, store as result, skip the short form.
        let rhs = self.arith_expr(rhs_min_prec)?;
        self.emit(Instr::Move { dst, src: rhs });
        let jmp_end = self.emit_jump(|offset| Instr::Jmp { offset });
        self.patch_jump(short_circuit_jump);
        if is_or {
            self.emit(Instr::LoadTrue { dst });
        } else {
            self.emit(Instr::LoadFalse { dst });
        }
        self.patch_jump(jmp_end);
        Ok(RegOrConst::Reg(dst))
    }

    fn unary(&mut self) -> PResult<Place> {
        match self.token.kind.clone() {
            TokenKind::PlusPlus => {
                self.advance()?;
                let place = self.unary()?;
                let cur = self.read_place_dup(&place)?;
                let dst = self.alloc_temp()?;
                self.emit(Instr::UnOp {
                    op: UnOp::PreInc,
                    dst,
                    src: cur,
                });
                self.write_place(place, RegOrConst::Reg(dst))?;
                Ok(Place::Value(RegOrConst::Reg(dst)))
            }
            TokenKind::MinusMinus => {
                self.advance()?;
                let place = self.unary()?;
                let cur = self.read_place_dup(&place)?;
                let dst = self.alloc_temp()?;
                self.emit(Instr::UnOp {
                    op: UnOp::PreDec,
                    dst,
                    src: cur,
                });
                self.write_place(place, RegOrConst::Reg(dst))?;
                Ok(Place::Value(RegOrConst::Reg(dst)))
            }
            TokenKind::Char('-') => {
                self.advance()?;
                let v = self.unary_to_value()?;
                let dst = self.alloc_temp()?;
                self.emit(Instr::UnOp {
                    op: UnOp::UMinus,
                    dst,
                    src: v,
                });
                Ok(Place::Value(RegOrConst::Reg(dst)))
            }
            TokenKind::Char('~') => {
                self.advance()?;
                let v = self.unary_to_value()?;
                let dst = self.alloc_temp()?;
                self.emit(Instr::UnOp {
                    op: UnOp::UNeg,
                    dst,
                    src: v,
                });
                Ok(Place::Value(RegOrConst::Reg(dst)))
            }
            TokenKind::Char('!') => {
                self.advance()?;
                let v = self.unary_to_value()?;
                let dst = self.alloc_temp()?;
                self.emit(Instr::UnOp {
                    op: UnOp::UNot,
                    dst,
                    src: v,
                });
                Ok(Place::Value(RegOrConst::Reg(dst)))
            }
            TokenKind::Delete => {
                self.advance()?;
                let place = self.unary()?;
                let v = self.read_place_dup(&place)?;
                let dst = self.alloc_temp()?;
                self.emit(Instr::UnOp {
                    op: UnOp::Deref,
                    dst,
                    src: v,
                });
                Ok(Place::Value(RegOrConst::Reg(dst)))
            }
            _ => self.postfix(),
        }
    }

    fn unary_to_value(&mut self) -> PResult<RegOrConst> {
        let place = self.unary()?;
        self.read_place(place)
    }

    fn postfix(&mut self) -> PResult<Place> {
        let mut place = self.primary()?;
        loop {
            match self.token.kind.clone() {
                TokenKind::Char('(') => {
                    self.advance()?;
                    let callee = self.read_place(place)?;
                    let callee_reg = self.to_reg(callee)?;
                    let nparams = self.argument_list(callee_reg)?;
                    self.expect(TokenKind::Char(')'))?;
                    self.emit(Instr::Call {
                        callee: callee_reg,
                        nparams,
                    });
                    place = Place::Value(RegOrConst::Reg(callee_reg));
                }
                TokenKind::Char('[') => {
                    self.advance()?;
                    let obj_v = self.read_place(place)?;
                    let obj_reg = self.to_reg(obj_v)?;
                    let idx = self.expr()?;
                    self.expect(TokenKind::Char(']'))?;
                    place = Place::Elt(obj_reg, idx);
                }
                TokenKind::Char('.') => {
                    self.advance()?;
                    let obj_v = self.read_place(place)?;
                    let obj_reg = self.to_reg(obj_v)?;
                    let key = self.expect_identifier()?;
                    place = Place::Prop(obj_reg, key);
                }
                TokenKind::PlusPlus => {
                    self.advance()?;
                    let cur = self.read_place_dup(&place)?;
                    let old = self.to_reg(cur)?;
                    let saved = self.alloc_temp()?;
                    self.emit(Instr::Move {
                        dst: saved,
                        src: RegOrConst::Reg(old),
                    });
                    let dst = self.alloc_temp()?;
                    self.emit(Instr::UnOp {
                        op: UnOp::PostInc,
                        dst,
                        src: RegOrConst::Reg(old),
                    });
                    self.write_place(place, RegOrConst::Reg(dst))?;
                    place = Place::Value(RegOrConst::Reg(saved));
                }
                TokenKind::MinusMinus => {
                    self.advance()?;
                    let cur = self.read_place_dup(&place)?;
                    let old = self.to_reg(cur)?;
                    let saved = self.alloc_temp()?;
                    self.emit(Instr::Move {
                        dst: saved,
                        src: RegOrConst::Reg(old),
                    });
                    let dst = self.alloc_temp()?;
                    self.emit(Instr::UnOp {
                        op: UnOp::PostDec,
                        dst,
                        src: RegOrConst::Reg(old),
                    });
                    self.write_place(place, RegOrConst::Reg(dst))?;
                    place = Place::Value(RegOrConst::Reg(saved));
                }
                _ => break,
            }
        }
        Ok(place)
    }

    /// Parses a call/new argument list, copying each argument into the
    /// contiguous register block `base+1 ..= base+nparams` the calling
    /// convention expects right after the callee register. Each argument's
    /// own sub-expression is free to use whatever scratch registers it
    /// needs above that block; only the final value is pinned in place.
    fn argument_list(&mut self, base: u8) -> PResult<u16> {
        let mut count: u16 = 0;
        if self.check(&TokenKind::Char(')')) {
            return Ok(0);
        }
        loop {
            let offset = 1 + count;
            if base as u32 + offset as u32 > MAX_REGISTER as u32 {
                return Err(Error::Semantic(
                    "too many arguments in call".into(),
                    self.loc(),
                ));
            }
            let target = base + offset as u8;
            let val = self.arith_expr(1)?;
            if val != RegOrConst::Reg(target) {
                self.emit(Instr::Move { dst: target, src: val });
            }
            self.reserve_register(target);
            count += 1;
            if !self.eat(&TokenKind::Char(','))? {
                break;
            }
        }
        Ok(count)
    }

    /// Marks `reg` as in-use for the rest of the current statement so later
    /// temp allocations don't reuse it (used after pinning a register to an
    /// explicit position outside the normal bump-allocator path).
    fn reserve_register(&mut self, reg: u8) {
        let entry = self.cur_mut();
        let locals_len = entry.locals_index.len() as u16;
        if reg as u16 >= locals_len {
            let offset = reg as u16 - locals_len + 1;
            entry.temp_mark = entry.temp_mark.max(offset);
            entry.max_temp_offset = entry.max_temp_offset.max(entry.temp_mark);
        }
    }

    fn primary(&mut self) -> PResult<Place> {
        match self.token.kind.clone() {
            TokenKind::This => {
                self.advance()?;
                let dst = self.alloc_temp()?;
                self.emit(Instr::LoadThis { dst });
                Ok(Place::Value(RegOrConst::Reg(dst)))
            }
            TokenKind::New => {
                self.advance()?;
                let place = self.postfix()?;
                let callee = self.read_place(place)?;
                let callee_reg = self.to_reg(callee)?;
                self.expect(TokenKind::Char('('))?;
                let nparams = self.argument_list(callee_reg)?;
                self.expect(TokenKind::Char(')'))?;
                self.emit(Instr::New {
                    callee: callee_reg,
                    nparams,
                });
                Ok(Place::Value(RegOrConst::Reg(callee_reg)))
            }
            TokenKind::Function => {
                let reg = self.function_literal(None)?;
                Ok(Place::Value(RegOrConst::Reg(reg)))
            }
            TokenKind::Identifier(name) => {
                self.advance()?;
                let atom = self.atoms.atomize(&name);
                Ok(self.resolve(atom))
            }
            TokenKind::IntegerLit(v) => {
                self.advance()?;
                let k = self.const_integer(v as i32);
                Ok(Place::Value(RegOrConst::Const(k)))
            }
            TokenKind::FloatLit(v) => {
                self.advance()?;
                let k = self.const_float(v);
                Ok(Place::Value(RegOrConst::Const(k)))
            }
            TokenKind::StringLit(s) => {
                self.advance()?;
                let k = self.const_string(&s);
                Ok(Place::Value(RegOrConst::Const(k)))
            }
            TokenKind::Char('(') => {
                self.advance()?;
                let v = self.expr()?;
                self.expect(TokenKind::Char(')'))?;
                Ok(Place::Value(v))
            }
            TokenKind::Char('[') => self.array_literal(),
            TokenKind::Char('{') => self.object_literal(),
            other => Err(Error::Syntax(format!("unexpected token {:?}", other), self.loc())),
        }
    }

    fn array_literal(&mut self) -> PResult<Place> {
        self.advance()?; // '['
        let dst = self.alloc_temp()?;
        self.emit(Instr::LoadLitA { dst });
        if !self.check(&TokenKind::Char(']')) {
            loop {
                let v = self.arith_expr(1)?;
                self.emit(Instr::AppendElt { arr: dst, val: v });
                if !self.eat(&TokenKind::Char(','))? {
                    break;
                }
            }
        }
        self.expect(TokenKind::Char(']'))?;
        Ok(Place::Value(RegOrConst::Reg(dst)))
    }

    fn object_literal(&mut self) -> PResult<Place> {
        self.advance()?; // '{'
        let dst = self.alloc_temp()?;
        self.emit(Instr::LoadLitO { dst });
        if !self.check(&TokenKind::Char('}')) {
            loop {
                let key = self.property_name()?;
                self.expect(TokenKind::Char(':'))?;
                let v = self.arith_expr(1)?;
                self.emit(Instr::AppendProp {
                    obj: dst,
                    key,
                    val: v,
                });
                if !self.eat(&TokenKind::Char(','))? {
                    break;
                }
            }
        }
        self.expect(TokenKind::Char('}'))?;
        Ok(Place::Value(RegOrConst::Reg(dst)))
    }

    fn property_name(&mut self) -> PResult<Atom> {
        match self.token.kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance()?;
                Ok(self.atoms.atomize(&name))
            }
            TokenKind::StringLit(name) => {
                self.advance()?;
                Ok(self.atoms.atomize(&name))
            }
            _ => Err(Error::Syntax("expected property name".into(), self.loc())),
        }
    }

    /// Parses a function literal `function (params) { body }` (the `name`
    /// is used only for diagnostics/the constant-pool `Function` entry's
    /// bookkeeping, not for binding — `function_stmt` handles that).
    fn function_literal(&mut self, name: Option<Atom>) -> PResult<u8> {
        self.advance()?; // 'function'
        let id = self.start_function();
        self.cur_mut().proto.name = name;
        self.cur_mut().locals_index.insert(shared::THIS, 0);
        self.cur_mut().proto.locals.push(shared::THIS);
        self.expect(TokenKind::Char('('))?;
        let formal_count = self.formal_parameter_list_into_current()?;
        self.expect(TokenKind::Char(')'))?;
        self.compound_stmt()?;
        self.emit(Instr::Ret { nvalues: 0 });
        self.end_function(id, formal_count);

        let func_const = self.const_index(Constant::Function(id));
        let dst = self.alloc_temp()?;
        self.emit(Instr::Closure { dst, func_const });
        Ok(dst)
    }
}

/// Parse `src` into a finished [`Program`], or the accumulated parse
/// errors if the source failed to compile.
pub fn parse(src: &str, atoms: &mut AtomTable) -> Result<Program, ParseErrorList> {
    let parser = match Parser::new(src, atoms) {
        Ok(p) => p,
        Err(e) => {
            let mut errs = ParseErrorList::new();
            errs.push(e);
            return Err(errs);
        }
    };
    let (program, errors) = parser.parse_program();
    match program {
        Some(p) if errors.is_empty() => Ok(p),
        _ => Err(errors),
    }
}
