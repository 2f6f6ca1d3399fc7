//! Code attribute and the label-based instruction stream used for insertion.
//!
//! Decoding turns every branch and switch target into a [`Label`] naming an
//! original instruction. Insertions are recorded around those instructions and
//! encoding lays everything out again, so offsets are never patched by hand.

use anyhow::{Context, Result};

use super::annotations::{
    RUNTIME_INVISIBLE_TYPE_ANNOTATIONS, RUNTIME_VISIBLE_TYPE_ANNOTATIONS,
    remap_code_type_annotations,
};
use super::bytes::{ByteReader, ByteSink, table_len};
use super::constant_pool::ConstantPool;
use super::stack_map::{STACK_MAP_TABLE, StackMapTable};
use super::{AttributeInfo, parse_attributes, write_attributes};
use crate::opcodes;

pub(crate) const CODE: &str = "Code";
const LINE_NUMBER_TABLE: &str = "LineNumberTable";
const LOCAL_VARIABLE_TABLE: &str = "LocalVariableTable";
const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";
const MAX_CODE_LENGTH: u32 = 65535;

/// Exception table entry with raw bytecode offsets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ExceptionEntry {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: u16,
}

/// Decoded Code attribute.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct CodeAttribute {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    pub(crate) attributes: Vec<AttributeInfo>,
}

impl CodeAttribute {
    /// Build a Code attribute for a freshly generated method body.
    pub(crate) fn generate(
        stream: &InstructionStream,
        max_stack: u16,
        max_locals: u16,
    ) -> Result<Self> {
        let encoded = stream.encode()?;
        Ok(Self {
            max_stack,
            max_locals,
            code: encoded.code,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        })
    }

    pub(crate) fn parse(info: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(info);
        let max_stack = reader.u16()?;
        let max_locals = reader.u16()?;
        let code_length = reader.u32()?;
        if code_length == 0 || code_length > MAX_CODE_LENGTH {
            anyhow::bail!("invalid code length {}", code_length);
        }
        let code = reader.bytes(code_length as usize)?.to_vec();
        let handler_count = reader.u16()?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            exception_table.push(ExceptionEntry {
                start_pc: reader.u16()?,
                end_pc: reader.u16()?,
                handler_pc: reader.u16()?,
                catch_type: reader.u16()?,
            });
        }
        let attributes = parse_attributes(&mut reader).context("parse code attributes")?;
        reader.expect_end("code attribute")?;
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.code.len() + 32);
        out.put_u16(self.max_stack);
        out.put_u16(self.max_locals);
        out.put_u32(self.code.len() as u32);
        out.extend_from_slice(&self.code);
        out.put_u16(table_len(self.exception_table.len(), "exception handlers")?);
        for entry in &self.exception_table {
            out.put_u16(entry.start_pc);
            out.put_u16(entry.end_pc);
            out.put_u16(entry.handler_pc);
            out.put_u16(entry.catch_type);
        }
        write_attributes(&mut out, &self.attributes)?;
        Ok(out)
    }

    /// Replace the code with the encoded stream and move every offset that the
    /// exception table and the known code attributes carry.
    pub(crate) fn apply(
        &mut self,
        stream: &InstructionStream,
        constant_pool: &ConstantPool,
        extra_stack: u16,
    ) -> Result<()> {
        let encoded = stream.encode()?;
        let remap = |offset: u32| -> Result<u32> { Ok(encoded.offset_of(stream.label_at(offset)?)) };

        for entry in &mut self.exception_table {
            entry.start_pc = narrow(remap(entry.start_pc as u32)?)?;
            entry.end_pc = narrow(remap(entry.end_pc as u32)?)?;
            entry.handler_pc = narrow(remap(entry.handler_pc as u32)?)?;
        }

        for attribute in &mut self.attributes {
            let index = attribute.name_index;
            if constant_pool.utf8_eq(index, LINE_NUMBER_TABLE) {
                attribute.info =
                    remap_line_numbers(&attribute.info, &remap).context("remap line numbers")?;
            } else if constant_pool.utf8_eq(index, LOCAL_VARIABLE_TABLE)
                || constant_pool.utf8_eq(index, LOCAL_VARIABLE_TYPE_TABLE)
            {
                attribute.info = remap_local_variables(&attribute.info, &remap)
                    .context("remap local variables")?;
            } else if constant_pool.utf8_eq(index, STACK_MAP_TABLE) {
                let mut table = StackMapTable::parse(&attribute.info).context("parse stack map")?;
                table.remap(remap)?;
                attribute.info = table.to_bytes()?;
            } else if constant_pool.utf8_eq(index, RUNTIME_VISIBLE_TYPE_ANNOTATIONS)
                || constant_pool.utf8_eq(index, RUNTIME_INVISIBLE_TYPE_ANNOTATIONS)
            {
                attribute.info = remap_code_type_annotations(&attribute.info, remap)
                    .context("remap type annotations")?;
            }
        }

        self.code = encoded.code;
        self.max_stack = self.max_stack.saturating_add(extra_stack);
        Ok(())
    }
}

fn remap_line_numbers<F>(info: &[u8], remap: &F) -> Result<Vec<u8>>
where
    F: Fn(u32) -> Result<u32>,
{
    let mut reader = ByteReader::new(info);
    let mut out = Vec::with_capacity(info.len());
    let count = reader.u16()?;
    out.put_u16(count);
    for _ in 0..count {
        let start_pc = reader.u16()? as u32;
        let line = reader.u16()?;
        out.put_u16(narrow(remap(start_pc)?)?);
        out.put_u16(line);
    }
    reader.expect_end("line number table")?;
    Ok(out)
}

fn remap_local_variables<F>(info: &[u8], remap: &F) -> Result<Vec<u8>>
where
    F: Fn(u32) -> Result<u32>,
{
    let mut reader = ByteReader::new(info);
    let mut out = Vec::with_capacity(info.len());
    let count = reader.u16()?;
    out.put_u16(count);
    for _ in 0..count {
        let start_pc = reader.u16()? as u32;
        let length = reader.u16()? as u32;
        let new_start = remap(start_pc)?;
        let new_end = remap(start_pc + length)?;
        out.put_u16(narrow(new_start)?);
        out.put_u16(narrow(new_end - new_start)?);
        // name, descriptor or signature, slot
        out.extend_from_slice(reader.bytes(6)?);
    }
    reader.expect_end("local variable table")?;
    Ok(out)
}

fn narrow(offset: u32) -> Result<u16> {
    u16::try_from(offset).context("bytecode offset exceeds 65535")
}

/// Position of an original instruction; the position one past the last
/// instruction denotes the end of the code.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct Label(pub(crate) usize);

/// Operand bytes of an instruction, with targets kept symbolic.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Operand {
    /// Operand bytes that do not depend on the instruction's position.
    Fixed(Vec<u8>),
    Branch(Label),
    WideBranch(Label),
    TableSwitch {
        default: Label,
        low: i32,
        high: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
}

/// One instruction of a stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Instruction {
    pub(crate) opcode: u8,
    pub(crate) operand: Operand,
}

impl Instruction {
    pub(crate) fn simple(opcode: u8) -> Self {
        Self {
            opcode,
            operand: Operand::Fixed(Vec::new()),
        }
    }

    pub(crate) fn with_u8(opcode: u8, value: u8) -> Self {
        Self {
            opcode,
            operand: Operand::Fixed(vec![value]),
        }
    }

    pub(crate) fn with_u16(opcode: u8, value: u16) -> Self {
        Self {
            opcode,
            operand: Operand::Fixed(value.to_be_bytes().to_vec()),
        }
    }

    pub(crate) fn branch(opcode: u8, target: Label) -> Self {
        Self {
            opcode,
            operand: Operand::Branch(target),
        }
    }

    /// Load a reference from a local variable slot.
    pub(crate) fn aload(slot: u16) -> Self {
        match slot {
            0..=3 => Self::simple(opcodes::ALOAD_0 + slot as u8),
            4..=255 => Self::with_u8(opcodes::ALOAD, slot as u8),
            _ => {
                let mut bytes = vec![opcodes::ALOAD];
                bytes.extend_from_slice(&slot.to_be_bytes());
                Self {
                    opcode: opcodes::WIDE,
                    operand: Operand::Fixed(bytes),
                }
            }
        }
    }

    /// Push a small non-negative int constant.
    pub(crate) fn push_int(value: u16) -> Self {
        match value {
            0..=5 => Self::simple(opcodes::ICONST_0 + value as u8),
            6..=127 => Self::with_u8(opcodes::BIPUSH, value as u8),
            _ => Self::with_u16(opcodes::SIPUSH, value),
        }
    }

    /// Load a single-slot constant pool entry.
    pub(crate) fn ldc(index: u16) -> Self {
        if index <= u8::MAX as u16 {
            Self::with_u8(opcodes::LDC, index as u8)
        } else {
            Self::with_u16(opcodes::LDC_W, index)
        }
    }

    /// Constant pool index carried by field and invoke instructions.
    pub(crate) fn pool_index(&self) -> Option<u16> {
        match &self.operand {
            Operand::Fixed(bytes) if bytes.len() >= 2 => Some(u16::from_be_bytes([bytes[0], bytes[1]])),
            _ => None,
        }
    }

    fn size(&self, pc: u32) -> u32 {
        match &self.operand {
            Operand::Fixed(bytes) => 1 + bytes.len() as u32,
            Operand::Branch(_) => 3,
            Operand::WideBranch(_) => 5,
            Operand::TableSwitch { targets, .. } => {
                1 + padding(pc) + 12 + 4 * targets.len() as u32
            }
            Operand::LookupSwitch { pairs, .. } => 1 + padding(pc) + 8 + 8 * pairs.len() as u32,
        }
    }

    fn emit(&self, out: &mut Vec<u8>, pc: u32, labels: &[u32]) -> Result<()> {
        out.put_u8(self.opcode);
        let relative = |label: &Label| -> Result<i64> {
            let target = labels
                .get(label.0)
                .with_context(|| format!("branch target {} out of range", label.0))?;
            Ok(*target as i64 - pc as i64)
        };
        match &self.operand {
            Operand::Fixed(bytes) => out.extend_from_slice(bytes),
            Operand::Branch(label) => {
                let delta = relative(label)?;
                let delta = i16::try_from(delta).with_context(|| {
                    format!("branch offset {delta} at {pc} no longer fits in 16 bits")
                })?;
                out.extend_from_slice(&delta.to_be_bytes());
            }
            Operand::WideBranch(label) => out.put_i32(relative(label)? as i32),
            Operand::TableSwitch {
                default,
                low,
                high,
                targets,
            } => {
                out.extend(std::iter::repeat_n(0u8, padding(pc) as usize));
                out.put_i32(relative(default)? as i32);
                out.put_i32(*low);
                out.put_i32(*high);
                for target in targets {
                    out.put_i32(relative(target)? as i32);
                }
            }
            Operand::LookupSwitch { default, pairs } => {
                out.extend(std::iter::repeat_n(0u8, padding(pc) as usize));
                out.put_i32(relative(default)? as i32);
                out.put_i32(pairs.len() as i32);
                for (key, target) in pairs {
                    out.put_i32(*key);
                    out.put_i32(relative(target)? as i32);
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Slot {
    before: Vec<Instruction>,
    instruction: Instruction,
    after: Vec<Instruction>,
}

/// Encoded bytecode plus the final offset of every label.
pub(crate) struct EncodedCode {
    pub(crate) code: Vec<u8>,
    label_offsets: Vec<u32>,
}

impl EncodedCode {
    pub(crate) fn offset_of(&self, label: Label) -> u32 {
        self.label_offsets[label.0]
    }
}

/// Mutable instruction stream of one method body.
#[derive(Clone, Debug)]
pub(crate) struct InstructionStream {
    entry: Vec<Instruction>,
    slots: Vec<Slot>,
    original_offsets: Vec<u32>,
    original_len: u32,
    modified: bool,
}

impl InstructionStream {
    /// Build a stream from instructions whose labels index into `instructions`.
    pub(crate) fn from_instructions(instructions: Vec<Instruction>) -> Self {
        let slots = instructions
            .into_iter()
            .map(|instruction| Slot {
                before: Vec::new(),
                instruction,
                after: Vec::new(),
            })
            .collect();
        Self {
            entry: Vec::new(),
            slots,
            original_offsets: Vec::new(),
            original_len: 0,
            modified: true,
        }
    }

    pub(crate) fn decode(code: &[u8]) -> Result<Self> {
        let mut original_offsets = Vec::new();
        let mut offset = 0usize;
        while offset < code.len() {
            original_offsets.push(offset as u32);
            let length = opcode_length(code, offset)?;
            if length == 0 || offset + length > code.len() {
                anyhow::bail!("invalid bytecode length at offset {}", offset);
            }
            offset += length;
        }
        let original_len = code.len() as u32;

        let label = |pc: u32, delta: i64| -> Result<Label> {
            let target = pc as i64 + delta;
            let target = u32::try_from(target)
                .with_context(|| format!("branch at {pc} targets negative offset {target}"))?;
            label_for(&original_offsets, original_len, target)
        };

        let mut slots = Vec::with_capacity(original_offsets.len());
        for &pc in &original_offsets {
            let start = pc as usize;
            let opcode = code[start];
            let length = opcode_length(code, start)?;
            let operand = match opcode {
                op if opcodes::is_short_branch(op) => {
                    let delta = i16::from_be_bytes([code[start + 1], code[start + 2]]);
                    Operand::Branch(label(pc, delta as i64)?)
                }
                op if opcodes::is_wide_branch(op) => {
                    let delta = read_i32(code, start + 1)?;
                    Operand::WideBranch(label(pc, delta as i64)?)
                }
                opcodes::TABLESWITCH => {
                    let base = start + 1 + padding(pc) as usize;
                    let default = label(pc, read_i32(code, base)? as i64)?;
                    let low = read_i32(code, base + 4)?;
                    let high = read_i32(code, base + 8)?;
                    let count = (high as i64 - low as i64 + 1) as usize;
                    let mut targets = Vec::with_capacity(count);
                    for index in 0..count {
                        targets.push(label(pc, read_i32(code, base + 12 + index * 4)? as i64)?);
                    }
                    Operand::TableSwitch {
                        default,
                        low,
                        high,
                        targets,
                    }
                }
                opcodes::LOOKUPSWITCH => {
                    let base = start + 1 + padding(pc) as usize;
                    let default = label(pc, read_i32(code, base)? as i64)?;
                    let npairs = read_i32(code, base + 4)? as usize;
                    let mut pairs = Vec::with_capacity(npairs);
                    for index in 0..npairs {
                        let key = read_i32(code, base + 8 + index * 8)?;
                        let target = label(pc, read_i32(code, base + 12 + index * 8)? as i64)?;
                        pairs.push((key, target));
                    }
                    Operand::LookupSwitch { default, pairs }
                }
                _ => Operand::Fixed(code[start + 1..start + length].to_vec()),
            };
            slots.push(Slot {
                before: Vec::new(),
                instruction: Instruction { opcode, operand },
                after: Vec::new(),
            });
        }

        Ok(Self {
            entry: Vec::new(),
            slots,
            original_offsets,
            original_len,
            modified: false,
        })
    }

    pub(crate) fn instructions(&self) -> impl Iterator<Item = (usize, &Instruction)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (index, &slot.instruction))
    }

    pub(crate) fn is_modified(&self) -> bool {
        self.modified
    }

    /// Label of the original instruction starting at `offset`.
    pub(crate) fn label_at(&self, offset: u32) -> Result<Label> {
        label_for(&self.original_offsets, self.original_len, offset)
    }

    /// Insert a group that runs before the first original instruction. Branches
    /// to the first instruction skip it.
    pub(crate) fn insert_at_entry(&mut self, group: Vec<Instruction>) {
        if group.is_empty() {
            return;
        }
        self.entry.extend(group);
        self.modified = true;
    }

    /// Insert a group immediately before an instruction. Branches to the
    /// instruction land on the group.
    pub(crate) fn insert_before(&mut self, index: usize, group: Vec<Instruction>) -> Result<()> {
        let slot = self
            .slots
            .get_mut(index)
            .with_context(|| format!("no instruction at position {index}"))?;
        if !group.is_empty() {
            slot.before.extend(group);
            self.modified = true;
        }
        Ok(())
    }

    /// Insert a group immediately after an instruction, ahead of any branch
    /// target that follows it.
    pub(crate) fn insert_after(&mut self, index: usize, group: Vec<Instruction>) -> Result<()> {
        let slot = self
            .slots
            .get_mut(index)
            .with_context(|| format!("no instruction at position {index}"))?;
        if !group.is_empty() {
            slot.after.extend(group);
            self.modified = true;
        }
        Ok(())
    }

    pub(crate) fn encode(&self) -> Result<EncodedCode> {
        let mut flat: Vec<&Instruction> = Vec::new();
        let mut label_positions = Vec::with_capacity(self.slots.len() + 1);
        flat.extend(self.entry.iter());
        for slot in &self.slots {
            label_positions.push(flat.len());
            flat.extend(slot.before.iter());
            flat.push(&slot.instruction);
            flat.extend(slot.after.iter());
        }
        label_positions.push(flat.len());

        let mut offsets = Vec::with_capacity(flat.len() + 1);
        let mut pc: u32 = 0;
        for instruction in &flat {
            offsets.push(pc);
            pc += instruction.size(pc);
        }
        offsets.push(pc);
        if pc == 0 || pc > MAX_CODE_LENGTH {
            anyhow::bail!("code length {} is outside 1..=65535", pc);
        }

        let label_offsets: Vec<u32> = label_positions
            .iter()
            .map(|position| offsets[*position])
            .collect();
        let mut code = Vec::with_capacity(pc as usize);
        for (instruction, pc) in flat.iter().zip(&offsets) {
            instruction.emit(&mut code, *pc, &label_offsets)?;
        }
        Ok(EncodedCode {
            code,
            label_offsets,
        })
    }
}

fn label_for(original_offsets: &[u32], original_len: u32, offset: u32) -> Result<Label> {
    if offset == original_len {
        return Ok(Label(original_offsets.len()));
    }
    original_offsets
        .binary_search(&offset)
        .map(Label)
        .map_err(|_| anyhow::anyhow!("offset {} does not start an instruction", offset))
}

/// Length of the instruction at `offset`, including its opcode.
pub(crate) fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        opcodes::BIPUSH => 2,
        opcodes::SIPUSH => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        opcodes::ILOAD..=opcodes::ALOAD => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        opcodes::IINC => 3,
        0x85..=0x98 => 1,
        opcodes::IFEQ..=opcodes::JSR => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        opcodes::IRETURN..=opcodes::RETURN => 1,
        opcodes::GETSTATIC..=opcodes::PUTFIELD => 3,
        opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        opcodes::NEW => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | opcodes::ATHROW => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        0xc5 => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        0xca => 1,
        0xfe | 0xff => 1,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset as u32) as usize;
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset as u32) as usize;
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code
        .get(offset + 1)
        .copied()
        .context("missing wide opcode")?;
    if opcode == opcodes::IINC { Ok(6) } else { Ok(4) }
}

fn padding(offset: u32) -> u32 {
    (4 - ((offset + 1) % 4)) % 4
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode i32 out of bounds")?;
    Ok(i32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}
