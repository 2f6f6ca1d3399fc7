use anyhow::{Context, Result};

use super::bytes::{ByteReader, ByteSink};

pub(crate) const RUNTIME_VISIBLE_ANNOTATIONS: &str = "RuntimeVisibleAnnotations";
pub(crate) const RUNTIME_INVISIBLE_ANNOTATIONS: &str = "RuntimeInvisibleAnnotations";
pub(crate) const RUNTIME_VISIBLE_PARAMETER_ANNOTATIONS: &str = "RuntimeVisibleParameterAnnotations";
pub(crate) const RUNTIME_INVISIBLE_PARAMETER_ANNOTATIONS: &str =
    "RuntimeInvisibleParameterAnnotations";
pub(crate) const RUNTIME_VISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeVisibleTypeAnnotations";
pub(crate) const RUNTIME_INVISIBLE_TYPE_ANNOTATIONS: &str = "RuntimeInvisibleTypeAnnotations";

/// Type descriptor indexes of the top-level annotations in a
/// Runtime{Visible,Invisible}Annotations payload.
pub(crate) fn annotation_type_indexes(info: &[u8]) -> Result<Vec<u16>> {
    let mut reader = ByteReader::new(info);
    let count = reader.u16()?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(skip_annotation(&mut reader)?);
    }
    reader.expect_end("annotations")?;
    Ok(types)
}

/// Type descriptor indexes per parameter entry of a
/// Runtime{Visible,Invisible}ParameterAnnotations payload.
pub(crate) fn parameter_annotation_type_indexes(info: &[u8]) -> Result<Vec<Vec<u16>>> {
    let mut reader = ByteReader::new(info);
    let parameter_count = reader.u8()?;
    let mut parameters = Vec::with_capacity(parameter_count as usize);
    for _ in 0..parameter_count {
        let count = reader.u16()?;
        let mut types = Vec::with_capacity(count as usize);
        for _ in 0..count {
            types.push(skip_annotation(&mut reader)?);
        }
        parameters.push(types);
    }
    reader.expect_end("parameter annotations")?;
    Ok(parameters)
}

/// Skip one annotation structure, returning its type index.
fn skip_annotation(reader: &mut ByteReader<'_>) -> Result<u16> {
    let type_index = reader.u16()?;
    let pairs = reader.u16()?;
    for _ in 0..pairs {
        let _name_index = reader.u16()?;
        skip_element_value(reader)?;
    }
    Ok(type_index)
}

fn skip_element_value(reader: &mut ByteReader<'_>) -> Result<()> {
    let tag = reader.u8()?;
    match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => reader.skip(2),
        b'e' => reader.skip(4),
        b'@' => skip_annotation(reader).map(|_| ()),
        b'[' => {
            let count = reader.u16()?;
            for _ in 0..count {
                skip_element_value(reader)?;
            }
            Ok(())
        }
        _ => anyhow::bail!("unknown annotation element tag 0x{:02x}", tag),
    }
}

/// Rewrite the bytecode offsets carried by a code-level
/// Runtime{Visible,Invisible}TypeAnnotations payload.
pub(crate) fn remap_code_type_annotations<F>(info: &[u8], mut remap: F) -> Result<Vec<u8>>
where
    F: FnMut(u32) -> Result<u32>,
{
    let mut reader = ByteReader::new(info);
    let mut out = Vec::with_capacity(info.len());
    let count = reader.u16()?;
    out.put_u16(count);
    for _ in 0..count {
        let target_type = reader.u8()?;
        out.put_u8(target_type);
        match target_type {
            // localvar and resource_variable
            0x40 | 0x41 => {
                let table_length = reader.u16()?;
                out.put_u16(table_length);
                for _ in 0..table_length {
                    let start = reader.u16()? as u32;
                    let length = reader.u16()? as u32;
                    let index = reader.u16()?;
                    let new_start = remap(start)?;
                    let new_end = remap(start + length)?;
                    out.put_u16(narrow(new_start)?);
                    out.put_u16(narrow(new_end - new_start)?);
                    out.put_u16(index);
                }
            }
            // exception_parameter
            0x42 => out.put_u16(reader.u16()?),
            // instanceof, new, constructor and method references
            0x43..=0x46 => {
                let offset = reader.u16()? as u32;
                out.put_u16(narrow(remap(offset)?)?);
            }
            // casts and explicit type arguments
            0x47..=0x4b => {
                let offset = reader.u16()? as u32;
                out.put_u16(narrow(remap(offset)?)?);
                out.put_u8(reader.u8()?);
            }
            _ => anyhow::bail!(
                "unexpected type annotation target 0x{:02x} in code",
                target_type
            ),
        }
        let path_length = reader.u8()?;
        out.put_u8(path_length);
        out.extend_from_slice(reader.bytes(path_length as usize * 2)?);
        let start = reader.position();
        skip_annotation(&mut reader)?;
        out.extend_from_slice(&info[start..reader.position()]);
    }
    reader.expect_end("type annotations")?;
    Ok(out)
}

fn narrow(offset: u32) -> Result<u16> {
    u16::try_from(offset).context("bytecode offset exceeds 65535")
}
