// JDWP type definitions
//
// Ids are 8 bytes on every modern JVM; the bridge does not negotiate
// IDSizes because it only ever launches current runtimes.

use serde::{Deserialize, Serialize};

pub type ObjectId = u64;
pub type ThreadId = ObjectId;

pub type ReferenceTypeId = u64;
pub type ClassId = ReferenceTypeId;

pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

/// A code position inside the remote VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub type_tag: u8, // 1=class, 2=interface, 3=array
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64, // bytecode index
}

/// One stack frame of a suspended thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

/// Method metadata from ReferenceType.Methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodInfo {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: i32,
}

/// Field metadata from ReferenceType.Fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    pub field_id: FieldId,
    pub name: String,
    pub signature: String,
    pub mod_bits: i32,
}

/// Class match from VirtualMachine.ClassesBySignature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassInfo {
    pub ref_type_tag: u8,
    pub type_id: ReferenceTypeId,
    pub status: i32,
}

/// VM identification from VirtualMachine.Version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmVersion {
    pub description: String,
    pub jdwp_major: i32,
    pub jdwp_minor: i32,
    pub vm_version: String,
    pub vm_name: String,
}

/// Tagged value as read from ReferenceType.GetValues. The bridge only ever
/// dereferences object-tagged values (the agent's stop throwable); other
/// tags are carried for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JdwpValue {
    Object(ObjectId),
    Boolean(bool),
    Int(i32),
    Long(i64),
    Void,
    Other(u8),
}

impl JdwpValue {
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            JdwpValue::Object(id) => Some(*id),
            _ => None,
        }
    }
}

pub mod value_tags {
    pub const ARRAY: u8 = b'[';
    pub const BYTE: u8 = b'B';
    pub const CHAR: u8 = b'C';
    pub const OBJECT: u8 = b'L';
    pub const FLOAT: u8 = b'F';
    pub const DOUBLE: u8 = b'D';
    pub const INT: u8 = b'I';
    pub const LONG: u8 = b'J';
    pub const SHORT: u8 = b'S';
    pub const VOID: u8 = b'V';
    pub const BOOLEAN: u8 = b'Z';
    pub const STRING: u8 = b's';
    pub const THREAD: u8 = b't';
    pub const THREAD_GROUP: u8 = b'g';
    pub const CLASS_LOADER: u8 = b'l';
    pub const CLASS_OBJECT: u8 = b'c';
}
