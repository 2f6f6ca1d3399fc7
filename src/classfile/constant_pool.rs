use anyhow::{Context, Result};

use super::bytes::{ByteReader, ByteSink};

/// Constant pool entry. Utf8 payloads stay in their modified UTF-8 encoding so
/// untouched entries are written back byte for byte.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Constant {
    /// Index 0 and the second slot of long/double entries.
    Unusable,
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Module {
        name_index: u16,
    },
    Package {
        name_index: u16,
    },
}

/// Resolved field or method reference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MemberRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

/// Class file constant pool with intern-on-add helpers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    pub(crate) fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    pub(crate) fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        let count = reader.u16().context("read constant pool count")?;
        if count == 0 {
            anyhow::bail!("constant pool count must be at least 1");
        }
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);
        while entries.len() < count as usize {
            let tag = reader.u8()?;
            let entry = match tag {
                1 => {
                    let len = reader.u16()? as usize;
                    Constant::Utf8(reader.bytes(len)?.to_vec())
                }
                3 => Constant::Integer(reader.i32()?),
                4 => Constant::Float(reader.u32()?),
                5 => {
                    let high = reader.u32()? as u64;
                    let low = reader.u32()? as u64;
                    Constant::Long(((high << 32) | low) as i64)
                }
                6 => {
                    let high = reader.u32()? as u64;
                    let low = reader.u32()? as u64;
                    Constant::Double((high << 32) | low)
                }
                7 => Constant::Class {
                    name_index: reader.u16()?,
                },
                8 => Constant::String {
                    string_index: reader.u16()?,
                },
                9 => Constant::Fieldref {
                    class_index: reader.u16()?,
                    name_and_type_index: reader.u16()?,
                },
                10 => Constant::Methodref {
                    class_index: reader.u16()?,
                    name_and_type_index: reader.u16()?,
                },
                11 => Constant::InterfaceMethodref {
                    class_index: reader.u16()?,
                    name_and_type_index: reader.u16()?,
                },
                12 => Constant::NameAndType {
                    name_index: reader.u16()?,
                    descriptor_index: reader.u16()?,
                },
                15 => Constant::MethodHandle {
                    reference_kind: reader.u8()?,
                    reference_index: reader.u16()?,
                },
                16 => Constant::MethodType {
                    descriptor_index: reader.u16()?,
                },
                17 => Constant::Dynamic {
                    bootstrap_method_attr_index: reader.u16()?,
                    name_and_type_index: reader.u16()?,
                },
                18 => Constant::InvokeDynamic {
                    bootstrap_method_attr_index: reader.u16()?,
                    name_and_type_index: reader.u16()?,
                },
                19 => Constant::Module {
                    name_index: reader.u16()?,
                },
                20 => Constant::Package {
                    name_index: reader.u16()?,
                },
                _ => anyhow::bail!("unsupported constant pool tag: {}", tag),
            };
            let wide = matches!(entry, Constant::Long(_) | Constant::Double(_));
            entries.push(entry);
            if wide {
                if entries.len() >= count as usize {
                    anyhow::bail!("long or double constant overruns the constant pool");
                }
                entries.push(Constant::Unusable);
            }
        }
        Ok(Self { entries })
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.entries.len() as u16);
        for entry in &self.entries {
            match entry {
                Constant::Unusable => {}
                Constant::Utf8(bytes) => {
                    out.put_u8(1);
                    out.put_u16(bytes.len() as u16);
                    out.extend_from_slice(bytes);
                }
                Constant::Integer(value) => {
                    out.put_u8(3);
                    out.put_i32(*value);
                }
                Constant::Float(bits) => {
                    out.put_u8(4);
                    out.put_u32(*bits);
                }
                Constant::Long(value) => {
                    out.put_u8(5);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                Constant::Double(bits) => {
                    out.put_u8(6);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                Constant::Class { name_index } => {
                    out.put_u8(7);
                    out.put_u16(*name_index);
                }
                Constant::String { string_index } => {
                    out.put_u8(8);
                    out.put_u16(*string_index);
                }
                Constant::Fieldref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.put_u8(9);
                    out.put_u16(*class_index);
                    out.put_u16(*name_and_type_index);
                }
                Constant::Methodref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.put_u8(10);
                    out.put_u16(*class_index);
                    out.put_u16(*name_and_type_index);
                }
                Constant::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                } => {
                    out.put_u8(11);
                    out.put_u16(*class_index);
                    out.put_u16(*name_and_type_index);
                }
                Constant::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    out.put_u8(12);
                    out.put_u16(*name_index);
                    out.put_u16(*descriptor_index);
                }
                Constant::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    out.put_u8(15);
                    out.put_u8(*reference_kind);
                    out.put_u16(*reference_index);
                }
                Constant::MethodType { descriptor_index } => {
                    out.put_u8(16);
                    out.put_u16(*descriptor_index);
                }
                Constant::Dynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    out.put_u8(17);
                    out.put_u16(*bootstrap_method_attr_index);
                    out.put_u16(*name_and_type_index);
                }
                Constant::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    out.put_u8(18);
                    out.put_u16(*bootstrap_method_attr_index);
                    out.put_u16(*name_and_type_index);
                }
                Constant::Module { name_index } => {
                    out.put_u8(19);
                    out.put_u16(*name_index);
                }
                Constant::Package { name_index } => {
                    out.put_u8(20);
                    out.put_u16(*name_index);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, index: u16) -> Result<&Constant> {
        match self.entries.get(index as usize) {
            None | Some(Constant::Unusable) => {
                anyhow::bail!("invalid constant pool index {}", index)
            }
            Some(entry) => Ok(entry),
        }
    }

    pub(crate) fn utf8_bytes(&self, index: u16) -> Result<&[u8]> {
        match self.get(index)? {
            Constant::Utf8(bytes) => Ok(bytes),
            _ => anyhow::bail!("constant {} is not a utf8 entry", index),
        }
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<String> {
        Ok(decode_modified_utf8(self.utf8_bytes(index)?))
    }

    /// Compare a utf8 entry against a plain string without decoding.
    pub(crate) fn utf8_eq(&self, index: u16, expected: &str) -> bool {
        self.utf8_bytes(index)
            .map(|bytes| bytes == encode_modified_utf8(expected).as_slice())
            .unwrap_or(false)
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => anyhow::bail!("constant {} is not a class entry", index),
        }
    }

    pub(crate) fn name_and_type(&self, index: u16) -> Result<(String, String)> {
        match self.get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => anyhow::bail!("constant {} is not a name and type entry", index),
        }
    }

    /// Resolve a Fieldref, Methodref or InterfaceMethodref.
    pub(crate) fn member_ref(&self, index: u16) -> Result<MemberRef> {
        let (class_index, name_and_type_index) = match self.get(index)? {
            Constant::Fieldref {
                class_index,
                name_and_type_index,
            }
            | Constant::Methodref {
                class_index,
                name_and_type_index,
            }
            | Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index),
            _ => anyhow::bail!("constant {} is not a member reference", index),
        };
        let owner = self.class_name(class_index).context("resolve owner")?;
        let (name, descriptor) = self
            .name_and_type(name_and_type_index)
            .context("resolve name and type")?;
        Ok(MemberRef {
            owner,
            name,
            descriptor,
        })
    }

    fn intern(&mut self, entry: Constant) -> Result<u16> {
        if let Some(index) = self.entries.iter().position(|existing| *existing == entry) {
            return Ok(index as u16);
        }
        if self.entries.len() >= u16::MAX as usize {
            anyhow::bail!("constant pool is full");
        }
        self.entries.push(entry);
        Ok((self.entries.len() - 1) as u16)
    }

    pub(crate) fn add_utf8(&mut self, value: &str) -> Result<u16> {
        let bytes = encode_modified_utf8(value);
        if bytes.len() > u16::MAX as usize {
            anyhow::bail!("utf8 constant is too long");
        }
        self.intern(Constant::Utf8(bytes))
    }

    pub(crate) fn add_class(&mut self, name: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        self.intern(Constant::Class { name_index })
    }

    /// Add a String constant that shares an existing utf8 entry.
    pub(crate) fn add_string(&mut self, value: &str) -> Result<u16> {
        let string_index = self.add_utf8(value)?;
        self.intern(Constant::String { string_index })
    }

    pub(crate) fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.intern(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub(crate) fn add_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.intern(Constant::Fieldref {
            class_index,
            name_and_type_index,
        })
    }

    pub(crate) fn add_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.intern(Constant::Methodref {
            class_index,
            name_and_type_index,
        })
    }
}

/// Decode modified UTF-8. Unpaired surrogates and malformed sequences become U+FFFD.
pub(crate) fn decode_modified_utf8(bytes: &[u8]) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let first = bytes[index];
        if first & 0x80 == 0 {
            units.push(first as u16);
            index += 1;
        } else if first & 0xe0 == 0xc0 && index + 1 < bytes.len() {
            let second = bytes[index + 1];
            units.push((((first & 0x1f) as u16) << 6) | (second & 0x3f) as u16);
            index += 2;
        } else if first & 0xf0 == 0xe0 && index + 2 < bytes.len() {
            let second = bytes[index + 1];
            let third = bytes[index + 2];
            units.push(
                (((first & 0x0f) as u16) << 12)
                    | (((second & 0x3f) as u16) << 6)
                    | (third & 0x3f) as u16,
            );
            index += 3;
        } else {
            units.push(0xfffd);
            index += 1;
        }
    }
    String::from_utf16_lossy(&units)
}

/// Encode a string as modified UTF-8 (NUL as two bytes, supplementary
/// characters as surrogate pairs).
pub(crate) fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => bytes.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                bytes.push(0xc0 | (unit >> 6) as u8);
                bytes.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                bytes.push(0xe0 | (unit >> 12) as u8);
                bytes.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                bytes.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    bytes
}
