//! Structural reader and writer for JVM class files.
//!
//! Attributes are kept as raw bytes unless a caller explicitly decodes them,
//! so a class that is parsed and written back without edits is byte-identical
//! to its input.

pub(crate) mod annotations;
pub(crate) mod bytes;
pub(crate) mod code;
pub(crate) mod constant_pool;
pub(crate) mod stack_map;

use anyhow::{Context, Result};

use self::bytes::{ByteReader, ByteSink, table_len};
use self::constant_pool::ConstantPool;

pub(crate) const MAGIC: u32 = 0xCAFEBABE;

pub(crate) const ACC_PUBLIC: u16 = 0x0001;
pub(crate) const ACC_PRIVATE: u16 = 0x0002;
pub(crate) const ACC_STATIC: u16 = 0x0008;
pub(crate) const ACC_FINAL: u16 = 0x0010;
pub(crate) const ACC_SUPER: u16 = 0x0020;
pub(crate) const ACC_INTERFACE: u16 = 0x0200;
pub(crate) const ACC_ABSTRACT: u16 = 0x0400;
pub(crate) const ACC_SYNTHETIC: u16 = 0x1000;
pub(crate) const ACC_ANNOTATION: u16 = 0x2000;

/// Raw attribute: name index plus undecoded payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AttributeInfo {
    pub(crate) name_index: u16,
    pub(crate) info: Vec<u8>,
}

/// Field or method entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MemberInfo {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) attributes: Vec<AttributeInfo>,
}

impl MemberInfo {
    pub(crate) fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

/// Parsed class file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ClassFile {
    pub(crate) minor_version: u16,
    pub(crate) major_version: u16,
    pub(crate) constant_pool: ConstantPool,
    pub(crate) access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    pub(crate) interfaces: Vec<u16>,
    pub(crate) fields: Vec<MemberInfo>,
    pub(crate) methods: Vec<MemberInfo>,
    pub(crate) attributes: Vec<AttributeInfo>,
}

impl ClassFile {
    /// Start an empty class with the given names and version.
    pub(crate) fn new(
        name: &str,
        super_name: &str,
        access_flags: u16,
        major_version: u16,
    ) -> Result<Self> {
        let mut constant_pool = ConstantPool::new();
        let this_class = constant_pool.add_class(name)?;
        let super_class = constant_pool.add_class(super_name)?;
        Ok(Self {
            minor_version: 0,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        })
    }

    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let magic = reader.u32().context("read magic")?;
        if magic != MAGIC {
            anyhow::bail!("invalid class file magic");
        }
        let minor_version = reader.u16()?;
        let major_version = reader.u16()?;
        let constant_pool = ConstantPool::parse(&mut reader).context("parse constant pool")?;
        let access_flags = reader.u16()?;
        let this_class = reader.u16()?;
        let super_class = reader.u16()?;
        let interface_count = reader.u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(reader.u16()?);
        }
        let fields = parse_members(&mut reader).context("parse fields")?;
        let methods = parse_members(&mut reader).context("parse methods")?;
        let attributes = parse_attributes(&mut reader).context("parse class attributes")?;
        reader.expect_end("class file")?;

        let class = Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        };
        class.name().context("resolve class name")?;
        Ok(class)
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.put_u32(MAGIC);
        out.put_u16(self.minor_version);
        out.put_u16(self.major_version);
        self.constant_pool.write(&mut out);
        out.put_u16(self.access_flags);
        out.put_u16(self.this_class);
        out.put_u16(self.super_class);
        out.put_u16(table_len(self.interfaces.len(), "interfaces")?);
        for interface in &self.interfaces {
            out.put_u16(*interface);
        }
        write_members(&mut out, &self.fields, "fields")?;
        write_members(&mut out, &self.methods, "methods")?;
        write_attributes(&mut out, &self.attributes)?;
        Ok(out)
    }

    pub(crate) fn name(&self) -> Result<String> {
        self.constant_pool.class_name(self.this_class)
    }

    pub(crate) fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub(crate) fn member_name(&self, member: &MemberInfo) -> Result<String> {
        self.constant_pool.utf8(member.name_index)
    }

    pub(crate) fn member_descriptor(&self, member: &MemberInfo) -> Result<String> {
        self.constant_pool.utf8(member.descriptor_index)
    }

    /// Find the first attribute with the given name.
    pub(crate) fn find_attribute<'a>(
        &self,
        attributes: &'a [AttributeInfo],
        name: &str,
    ) -> Option<&'a AttributeInfo> {
        attributes
            .iter()
            .find(|attribute| self.constant_pool.utf8_eq(attribute.name_index, name))
    }

    pub(crate) fn has_method(&self, name: &str) -> bool {
        self.methods
            .iter()
            .any(|method| self.constant_pool.utf8_eq(method.name_index, name))
    }

    pub(crate) fn add_interface(&mut self, name: &str) -> Result<()> {
        let index = self.constant_pool.add_class(name)?;
        self.interfaces.push(index);
        Ok(())
    }

    pub(crate) fn add_field(&mut self, access_flags: u16, name: &str, descriptor: &str) -> Result<()> {
        let name_index = self.constant_pool.add_utf8(name)?;
        let descriptor_index = self.constant_pool.add_utf8(descriptor)?;
        self.fields.push(MemberInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes: Vec::new(),
        });
        Ok(())
    }

    /// Append a method; `code` is an already serialized Code attribute payload.
    pub(crate) fn add_method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: Option<Vec<u8>>,
    ) -> Result<()> {
        let name_index = self.constant_pool.add_utf8(name)?;
        let descriptor_index = self.constant_pool.add_utf8(descriptor)?;
        let mut attributes = Vec::new();
        if let Some(info) = code {
            attributes.push(AttributeInfo {
                name_index: self.constant_pool.add_utf8("Code")?,
                info,
            });
        }
        self.methods.push(MemberInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
        Ok(())
    }

    pub(crate) fn add_attribute(&mut self, name: &str, info: Vec<u8>) -> Result<()> {
        let name_index = self.constant_pool.add_utf8(name)?;
        self.attributes.push(AttributeInfo { name_index, info });
        Ok(())
    }
}

/// Read only the class name from class file bytes.
pub(crate) fn peek_class_name(data: &[u8]) -> Result<String> {
    let mut reader = ByteReader::new(data);
    if reader.u32().context("read magic")? != MAGIC {
        anyhow::bail!("invalid class file magic");
    }
    reader.skip(4)?;
    let constant_pool = ConstantPool::parse(&mut reader).context("parse constant pool")?;
    let _access_flags = reader.u16()?;
    let this_class = reader.u16()?;
    constant_pool.class_name(this_class)
}

fn parse_members(reader: &mut ByteReader<'_>) -> Result<Vec<MemberInfo>> {
    let count = reader.u16()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access_flags = reader.u16()?;
        let name_index = reader.u16()?;
        let descriptor_index = reader.u16()?;
        let attributes = parse_attributes(reader)?;
        members.push(MemberInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }
    Ok(members)
}

pub(crate) fn parse_attributes(reader: &mut ByteReader<'_>) -> Result<Vec<AttributeInfo>> {
    let count = reader.u16()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = reader.u16()?;
        let length = reader.u32()? as usize;
        let info = reader.bytes(length)?.to_vec();
        attributes.push(AttributeInfo { name_index, info });
    }
    Ok(attributes)
}

fn write_members(out: &mut Vec<u8>, members: &[MemberInfo], what: &str) -> Result<()> {
    out.put_u16(table_len(members.len(), what)?);
    for member in members {
        out.put_u16(member.access_flags);
        out.put_u16(member.name_index);
        out.put_u16(member.descriptor_index);
        write_attributes(out, &member.attributes)?;
    }
    Ok(())
}

pub(crate) fn write_attributes(out: &mut Vec<u8>, attributes: &[AttributeInfo]) -> Result<()> {
    out.put_u16(table_len(attributes.len(), "attributes")?);
    for attribute in attributes {
        out.put_u16(attribute.name_index);
        let length = u32::try_from(attribute.info.len()).context("attribute too long")?;
        out.put_u32(length);
        out.extend_from_slice(&attribute.info);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::ClassFileBuilder;

    #[test]
    fn unmodified_class_round_trips_byte_for_byte() {
        let mut builder = ClassFileBuilder::new("com/example/Foo", "java/lang/Object");
        builder.add_field(0x0002, "text", "Ljava/lang/String;");
        builder.add_method(0x0001, "run", "()V", vec![0xb1], 0, 1);
        let bytes = builder.finish();

        let parsed = ClassFile::parse(&bytes).expect("parse");

        assert_eq!(parsed.name().expect("name"), "com/example/Foo");
        assert_eq!(parsed.fields.len(), 1);
        assert_eq!(parsed.methods.len(), 1);
        assert_eq!(parsed.to_bytes().expect("write"), bytes);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let error = ClassFile::parse(b"nope").expect_err("invalid");
        assert!(format!("{error:#}").contains("magic") || format!("{error:#}").contains("bounds"));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = ClassFileBuilder::new("A", "java/lang/Object").finish();
        bytes.push(0);

        let error = ClassFile::parse(&bytes).expect_err("trailing");
        assert!(format!("{error:#}").contains("trailing bytes"));
    }

    #[test]
    fn truncated_class_is_rejected() {
        let bytes = ClassFileBuilder::new("A", "java/lang/Object").finish();

        assert!(ClassFile::parse(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn peek_reads_the_class_name() {
        let bytes = ClassFileBuilder::new("a/b/C", "java/lang/Object").finish();

        assert_eq!(peek_class_name(&bytes).expect("name"), "a/b/C");
    }
}
