use anyhow::{Context, Result};

use super::bytes::{ByteReader, ByteSink, table_len};

pub(crate) const STACK_MAP_TABLE: &str = "StackMapTable";

/// Verification type of a stack map frame entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    /// Offset of the `new` instruction that created the value.
    Uninitialized(u32),
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum FrameKind {
    Same,
    SameLocals1StackItem(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

/// Stack map frame anchored at an absolute bytecode offset.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Frame {
    offset: u32,
    kind: FrameKind,
}

/// Decoded StackMapTable with absolute offsets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct StackMapTable {
    frames: Vec<Frame>,
}

impl StackMapTable {
    pub(crate) fn parse(info: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(info);
        let count = reader.u16()?;
        let mut frames = Vec::with_capacity(count as usize);
        let mut previous: Option<u32> = None;
        for _ in 0..count {
            let frame_type = reader.u8()?;
            let (delta, kind) = match frame_type {
                0..=63 => (frame_type as u32, FrameKind::Same),
                64..=127 => (
                    (frame_type - 64) as u32,
                    FrameKind::SameLocals1StackItem(read_type(&mut reader)?),
                ),
                247 => {
                    let delta = reader.u16()? as u32;
                    (
                        delta,
                        FrameKind::SameLocals1StackItem(read_type(&mut reader)?),
                    )
                }
                248..=250 => (reader.u16()? as u32, FrameKind::Chop(251 - frame_type)),
                251 => (reader.u16()? as u32, FrameKind::Same),
                252..=254 => {
                    let delta = reader.u16()? as u32;
                    let mut locals = Vec::new();
                    for _ in 0..(frame_type - 251) {
                        locals.push(read_type(&mut reader)?);
                    }
                    (delta, FrameKind::Append(locals))
                }
                255 => {
                    let delta = reader.u16()? as u32;
                    let locals = read_types(&mut reader)?;
                    let stack = read_types(&mut reader)?;
                    (delta, FrameKind::Full { locals, stack })
                }
                _ => anyhow::bail!("reserved stack map frame type {}", frame_type),
            };
            let offset = match previous {
                None => delta,
                Some(previous) => previous + delta + 1,
            };
            previous = Some(offset);
            frames.push(Frame { offset, kind });
        }
        reader.expect_end("stack map table")?;
        Ok(Self { frames })
    }

    /// Move every frame and every `Uninitialized` reference to new offsets.
    pub(crate) fn remap<F>(&mut self, mut remap: F) -> Result<()>
    where
        F: FnMut(u32) -> Result<u32>,
    {
        for frame in &mut self.frames {
            frame.offset = remap(frame.offset)?;
            match &mut frame.kind {
                FrameKind::Same | FrameKind::Chop(_) => {}
                FrameKind::SameLocals1StackItem(item) => remap_type(item, &mut remap)?,
                FrameKind::Append(locals) => {
                    for local in locals {
                        remap_type(local, &mut remap)?;
                    }
                }
                FrameKind::Full { locals, stack } => {
                    for item in locals.iter_mut().chain(stack.iter_mut()) {
                        remap_type(item, &mut remap)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Encode frames, picking the compact form each delta allows.
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.put_u16(table_len(self.frames.len(), "stack map frames")?);
        let mut previous: Option<u32> = None;
        for frame in &self.frames {
            let delta = match previous {
                None => frame.offset,
                Some(previous) => frame
                    .offset
                    .checked_sub(previous + 1)
                    .context("stack map frames out of order")?,
            };
            previous = Some(frame.offset);
            let delta16 = u16::try_from(delta).context("stack map offset exceeds 65535")?;
            match &frame.kind {
                FrameKind::Same if delta <= 63 => out.put_u8(delta as u8),
                FrameKind::Same => {
                    out.put_u8(251);
                    out.put_u16(delta16);
                }
                FrameKind::SameLocals1StackItem(item) => {
                    if delta <= 63 {
                        out.put_u8(64 + delta as u8);
                    } else {
                        out.put_u8(247);
                        out.put_u16(delta16);
                    }
                    write_type(&mut out, item)?;
                }
                FrameKind::Chop(count) => {
                    out.put_u8(251 - count);
                    out.put_u16(delta16);
                }
                FrameKind::Append(locals) => {
                    out.put_u8(251 + locals.len() as u8);
                    out.put_u16(delta16);
                    for local in locals {
                        write_type(&mut out, local)?;
                    }
                }
                FrameKind::Full { locals, stack } => {
                    out.put_u8(255);
                    out.put_u16(delta16);
                    out.put_u16(table_len(locals.len(), "frame locals")?);
                    for local in locals {
                        write_type(&mut out, local)?;
                    }
                    out.put_u16(table_len(stack.len(), "frame stack items")?);
                    for item in stack {
                        write_type(&mut out, item)?;
                    }
                }
            }
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn offsets(&self) -> Vec<u32> {
        self.frames.iter().map(|frame| frame.offset).collect()
    }
}

fn read_types(reader: &mut ByteReader<'_>) -> Result<Vec<VerificationType>> {
    let count = reader.u16()?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(read_type(reader)?);
    }
    Ok(types)
}

fn read_type(reader: &mut ByteReader<'_>) -> Result<VerificationType> {
    let tag = reader.u8()?;
    let value = match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(reader.u16()?),
        8 => VerificationType::Uninitialized(reader.u16()? as u32),
        _ => anyhow::bail!("unknown verification type tag {}", tag),
    };
    Ok(value)
}

fn remap_type<F>(value: &mut VerificationType, remap: &mut F) -> Result<()>
where
    F: FnMut(u32) -> Result<u32>,
{
    if let VerificationType::Uninitialized(offset) = value {
        *offset = remap(*offset)?;
    }
    Ok(())
}

fn write_type(out: &mut Vec<u8>, value: &VerificationType) -> Result<()> {
    match value {
        VerificationType::Top => out.put_u8(0),
        VerificationType::Integer => out.put_u8(1),
        VerificationType::Float => out.put_u8(2),
        VerificationType::Double => out.put_u8(3),
        VerificationType::Long => out.put_u8(4),
        VerificationType::Null => out.put_u8(5),
        VerificationType::UninitializedThis => out.put_u8(6),
        VerificationType::Object(index) => {
            out.put_u8(7);
            out.put_u16(*index);
        }
        VerificationType::Uninitialized(offset) => {
            out.put_u8(8);
            out.put_u16(u16::try_from(*offset).context("uninitialized offset exceeds 65535")?);
        }
    }
    Ok(())
}
