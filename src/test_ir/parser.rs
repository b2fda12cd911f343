//! Text IR parser.

use crate::core::constraint::OpndSize;
use crate::core::error::{AllocError, AllocResult};
use crate::core::register_file::{RegKind, RegName};
use crate::ia32::opcodes::Cond;
use crate::ir::{BlockId, Function, InstId, Location, OpndId, OpndType};
use std::collections::HashMap;

/// Parse a file holding exactly one function.
pub fn parse_function(text: &str) -> AllocResult<Function> {
    let mut funcs = parse_module(text)?;
    match funcs.len() {
        1 => Ok(funcs.remove(0)),
        n => Err(AllocError::Parse {
            line: 1,
            reason: format!("Expected one function but found {}", n),
        }),
    }
}

/// Parse every function in `text`.
pub fn parse_module(text: &str) -> AllocResult<Vec<Function>> {
    Parser::new(text).parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,

    // Per-function maps
    blocks: HashMap<&'a str, BlockId>,
    values: HashMap<&'a str, OpndId>,
    fixed: HashMap<String, OpndId>,
    target_resolves: Vec<Resolve<'a>>,
    dispatch_resolves: Vec<Resolve<'a>>,
}

/// A block reference waiting for its definition.
#[derive(Debug)]
struct Resolve<'a> {
    name: &'a str,
    /// Instruction (or block, for dispatch edges) holding the reference.
    owner: usize,
    index: usize,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            blocks: HashMap::new(),
            values: HashMap::new(),
            fixed: HashMap::new(),
            target_resolves: Vec::new(),
            dispatch_resolves: Vec::new(),
        }
    }

    fn parse(mut self) -> AllocResult<Vec<Function>> {
        let mut funcs = Vec::new();
        self.skip_whitespace(true);
        while !self.is_eof() {
            let func = self.parse_function().map_err(|reason| self.error(reason))?;
            log::trace!("parsed function {} with {} blocks", func.name, func.blocks.len());
            funcs.push(func);
            self.skip_whitespace(true);
        }
        Ok(funcs)
    }

    fn error(&self, reason: String) -> AllocError {
        AllocError::Parse {
            line: self.line(),
            reason,
        }
    }

    fn line(&self) -> usize {
        self.text[..self.pos.min(self.text.len())]
            .bytes()
            .filter(|&b| b == b'\n')
            .count()
            + 1
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Comment runs to the end of the line; the newline itself is
                // left for the caller when newlines matter.
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), String> {
        if !self.try_read(ch) {
            return Err(format!(
                "Expected '{}' but found {:?}",
                ch,
                self.current_char()
            ));
        }
        Ok(())
    }

    fn at_line_end(&mut self) -> bool {
        self.skip_whitespace(false);
        matches!(self.current_char(), None | Some('\n') | Some('}'))
    }

    fn read_word(&mut self, extra: &[char]) -> Result<&'a str, String> {
        self.skip_whitespace(false);
        let start = self.pos;

        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            Some(ch) => return Err(format!("Expected identifier but found '{}'", ch)),
            None => return Err("Expected identifier but found EOF".to_string()),
        }

        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' || extra.contains(&ch) {
                self.advance();
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_identifier(&mut self) -> Result<&'a str, String> {
        self.read_word(&[])
    }

    /// Value and block names may contain dots.
    fn read_name(&mut self) -> Result<&'a str, String> {
        self.read_word(&['.'])
    }

    fn read_number(&mut self) -> Result<i64, String> {
        self.skip_whitespace(false);
        let negative = self.current_char() == Some('-');
        if negative {
            self.advance();
        }
        let start = self.pos;
        let is_hex = self.text[self.pos..].starts_with("0x") || self.text[self.pos..].starts_with("0X");
        if is_hex {
            self.pos += 2;
        }
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_hexdigit() && (is_hex || ch.is_ascii_digit()) {
                self.advance();
            } else {
                break;
            }
        }

        let digits = if is_hex {
            &self.text[start + 2..self.pos]
        } else {
            &self.text[start..self.pos]
        };
        if digits.is_empty() {
            return Err("Expected number".to_string());
        }
        let radix = if is_hex { 16 } else { 10 };
        let value = i64::from_str_radix(digits, radix)
            .map_err(|e| format!("Failed to parse number: {}", e))?;
        Ok(if negative { -value } else { value })
    }

    fn read_type(&mut self) -> Result<OpndType, String> {
        let name = self.read_identifier()?;
        OpndType::parse(name).ok_or_else(|| format!("Unknown type '{}'", name))
    }

    fn parse_function(&mut self) -> Result<Function, String> {
        let keyword = self.read_identifier()?;
        if keyword != "func" {
            return Err(format!("Expected 'func' but found '{}'", keyword));
        }
        let name = self.read_name()?;
        let mut func = Function::new(name);

        // Reset per-function state
        self.blocks.clear();
        self.values.clear();
        self.fixed.clear();
        self.target_resolves.clear();
        self.dispatch_resolves.clear();

        self.skip_whitespace(true);
        self.expect('{')?;
        let mut current: Option<BlockId> = None;
        loop {
            self.skip_whitespace(true);
            if self.try_read('}') {
                break;
            }
            if self.is_eof() {
                return Err(format!("Unterminated function '{}'", name));
            }

            // A label is an identifier followed directly by ':'.
            let saved_pos = self.pos;
            let word = self.read_name()?;
            if self.try_read(':') {
                current = Some(self.parse_block_header(&mut func, word)?);
                continue;
            }
            self.pos = saved_pos;

            let block = current.ok_or_else(|| "Instruction outside of a block".to_string())?;
            self.parse_instruction(&mut func, block)?;
        }

        self.resolve_function_references(&mut func)?;
        func.compute_successors();
        Ok(func)
    }

    fn parse_block_header(&mut self, func: &mut Function, name: &'a str) -> Result<BlockId, String> {
        if self.blocks.contains_key(name) {
            return Err(format!("Duplicate block '{}'", name));
        }
        let block = func.add_block(name);
        self.blocks.insert(name, block);

        if !self.at_line_end() {
            let saved_pos = self.pos;
            match self.read_identifier() {
                Ok("dispatch") => {
                    let handler = self.read_block_ref()?;
                    self.dispatch_resolves.push(Resolve {
                        name: handler,
                        owner: block,
                        index: 0,
                        line: self.line(),
                    });
                }
                _ => {
                    self.pos = saved_pos;
                    return Err(format!("Unexpected text after label '{}'", name));
                }
            }
        }
        Ok(block)
    }

    fn read_block_ref(&mut self) -> Result<&'a str, String> {
        self.expect('^')?;
        self.read_name()
    }

    fn parse_instruction(&mut self, func: &mut Function, block: BlockId) -> Result<InstId, String> {
        let mnemonic = self.read_identifier()?;
        let cond = if self.current_char() == Some('.') {
            self.advance();
            let suffix = self.read_identifier()?;
            Some(Cond::parse(suffix).ok_or_else(|| format!("Unknown condition '{}'", suffix))?)
        } else {
            None
        };

        let mut opnds = Vec::new();
        let mut targets = Vec::new();
        if !self.at_line_end() {
            loop {
                self.skip_whitespace(false);
                if self.current_char() == Some('^') {
                    targets.push(self.read_block_ref()?);
                } else {
                    opnds.push(self.parse_operand(func)?);
                }
                if !self.try_read(',') {
                    break;
                }
            }
        }
        if !self.at_line_end() {
            return Err(format!("Unexpected {:?} after operands", self.current_char()));
        }

        let inst = func
            .make_inst(mnemonic, cond, opnds, vec![0; targets.len()])
            .map_err(|e| e.to_string())?;
        let id = func.push_inst(block, inst);
        for (index, name) in targets.into_iter().enumerate() {
            self.target_resolves.push(Resolve {
                name,
                owner: id,
                index,
                line: self.line(),
            });
        }
        Ok(id)
    }

    fn parse_operand(&mut self, func: &mut Function) -> Result<OpndId, String> {
        match self.current_char() {
            Some('%') => {
                self.advance();
                let name = self.read_name()?;
                let ty = if self.current_char() == Some(':') {
                    self.advance();
                    Some(self.read_type()?)
                } else {
                    None
                };
                match (self.values.get(name).copied(), ty) {
                    (Some(id), None) => Ok(id),
                    (Some(id), Some(ty)) if func.operands[id].ty == ty => Ok(id),
                    (Some(id), Some(ty)) => Err(format!(
                        "%{} redeclared as {} (was {})",
                        name, ty, func.operands[id].ty
                    )),
                    (None, Some(ty)) => {
                        let id = func.add_operand(name, ty, Location::None);
                        self.values.insert(name, id);
                        Ok(id)
                    }
                    (None, None) => Err(format!("First use of %{} needs a type", name)),
                }
            }
            Some('$') => {
                self.advance();
                let value = self.read_number()?;
                Ok(func.add_imm(value, OpndType::I32))
            }
            Some('[') => {
                self.advance();
                self.skip_whitespace(false);
                if self.current_char() != Some('s') {
                    return Err("Expected stack slot 'sN'".to_string());
                }
                self.advance();
                let slot = self.read_number()?;
                let slot = usize::try_from(slot).map_err(|_| format!("Bad slot number {}", slot))?;
                self.expect(':')?;
                let ty = self.read_type()?;
                self.expect(']')?;
                if ty == OpndType::Flags {
                    return Err("Flags cannot live in a stack slot".to_string());
                }
                while func.slots.len() <= slot {
                    func.add_slot(ty.size(), None);
                }
                let key = format!("[s{}:{}]", slot, ty);
                Ok(self.fixed_operand(func, key, ty, Location::Mem(slot)))
            }
            Some(ch) if ch.is_alphabetic() => {
                let name = self.read_identifier()?;
                let reg = RegName::parse(name).ok_or_else(|| format!("Unknown register '{}'", name))?;
                let ty = match (reg.kind, reg.size) {
                    (RegKind::Gp, OpndSize::S8) => OpndType::I8,
                    (RegKind::Gp, OpndSize::S32) => OpndType::I32,
                    (RegKind::Xmm, _) => OpndType::F64,
                    (RegKind::Status, _) => OpndType::Flags,
                    _ => return Err(format!("Register '{}' cannot be an operand", name)),
                };
                Ok(self.fixed_operand(func, reg.to_string(), ty, Location::Reg(reg)))
            }
            other => Err(format!("Expected operand but found {:?}", other)),
        }
    }

    /// Concrete register and slot operands are shared per spelling.
    fn fixed_operand(&mut self, func: &mut Function, key: String, ty: OpndType, loc: Location) -> OpndId {
        if let Some(&id) = self.fixed.get(&key) {
            return id;
        }
        let id = func.add_operand(&key, ty, loc);
        self.fixed.insert(key, id);
        id
    }

    fn resolve_function_references(&mut self, func: &mut Function) -> Result<(), String> {
        for resolve in &self.target_resolves {
            let block = self.lookup_block(resolve)?;
            func.insts[resolve.owner].targets[resolve.index] = block;
        }
        for resolve in &self.dispatch_resolves {
            let block = self.lookup_block(resolve)?;
            func.blocks[resolve.owner].dispatch = Some(block);
        }
        Ok(())
    }

    fn lookup_block(&self, resolve: &Resolve<'a>) -> Result<BlockId, String> {
        self.blocks.get(resolve.name).copied().ok_or_else(|| {
            format!(
                "Undefined block '^{}' referenced at line {}",
                resolve.name, resolve.line
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::EAX;

    #[test]
    fn test_parse_simple_function() {
        let func = parse_function(
            r#"
            ; three values, one of them spilled by hand
            func f {
            entry:
                mov %a:i32, $1
                mov [s0:i32], eax
                add %a, [s0:i32]
                push %a
                ret
            }
            "#,
        )
        .unwrap();

        assert_eq!(func.name, "f");
        assert_eq!(func.blocks.len(), 1);
        assert_eq!(func.blocks[0].insts.len(), 5);
        assert_eq!(func.slots.len(), 1);
        assert_eq!(func.inst_to_string(1), "mov [s0:i32], eax");
        let eax = func.insts[1].opnds[1];
        assert_eq!(func.operands[eax].reg(), Some(RegName::gp32(EAX)));
        // The same slot spelling yields the same operand.
        assert_eq!(func.insts[1].opnds[0], func.insts[2].opnds[1]);
    }

    #[test]
    fn test_forward_block_references() {
        let func = parse_function(
            r#"
            func g {
            entry: dispatch ^handler
                cmp %f:flags, %x:i32, $0x10
                j.l %f, ^done
            body:
                jmp ^done
            done:
                ret
            handler:
                ret
            }
            "#,
        )
        .unwrap();

        assert_eq!(func.blocks[0].dispatch, Some(3));
        assert_eq!(func.insts[1].targets, vec![2]);
        assert_eq!(func.insts[1].cond, Some(Cond::L));
        assert_eq!(func.blocks[0].succs, vec![2, 1]);
        assert_eq!(func.blocks[1].succs, vec![2]);
        assert!(func.blocks[2].succs.is_empty());
    }

    #[test]
    fn test_negative_and_hex_immediates() {
        let func = parse_function("func h {\nentry:\n  push $-5\n  push $0xff\n  ret\n}\n").unwrap();
        let first = func.insts[0].opnds[0];
        let second = func.insts[1].opnds[0];
        assert_eq!(func.operands[first].loc, Location::Imm(-5));
        assert_eq!(func.operands[second].loc, Location::Imm(255));
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = parse_function("func f {\nentry:\n  push %a\n}\n").unwrap_err();
        assert_eq!(
            err,
            AllocError::Parse {
                line: 3,
                reason: "First use of %a needs a type".to_string()
            }
        );

        let err = parse_function("func f {\nentry:\n  frob %a:i32\n}\n").unwrap_err();
        assert!(matches!(err, AllocError::Parse { line: 3, .. }));

        let err = parse_function("func f {\nentry:\n  jmp ^nowhere\n}\n").unwrap_err();
        assert!(err.to_string().contains("nowhere"));

        assert!(parse_function("func f {\n  ret\n}\n").is_err());
        assert!(parse_function("func f {\nentry:\n  mov %a:i32, %a:f64\n}\n").is_err());
    }

    #[test]
    fn test_printer_round_trip() {
        let text = r#"
            func r {
            entry: dispatch ^h
                mov %a:i32, $7
                cmp %c:flags, %a, ecx
                set.ne %c, %b:i8
                movsd xmm1, [s2:f64]
                call $64
                j.ne %c, ^h
            tail:
                ret eax
            h:
                ret
            }
        "#;
        let func = parse_function(text).unwrap();
        let printed = func.to_string();
        let reparsed = parse_function(&printed).unwrap();
        assert_eq!(printed, reparsed.to_string());
        assert_eq!(reparsed.slots.len(), 3);
    }

    #[test]
    fn test_parse_module() {
        let funcs = parse_module("func a {\nentry:\n ret\n}\nfunc b {\nentry:\n ret\n}\n").unwrap();
        assert_eq!(funcs.len(), 2);
        assert_eq!(funcs[1].name, "b");
        assert!(parse_function("func a {\nentry:\n ret\n}\nfunc b {\nentry:\n ret\n}\n").is_err());
    }
}
