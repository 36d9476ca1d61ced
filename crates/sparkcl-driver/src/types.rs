//! Scalar element types and device descriptions shared by every driver.

use std::fmt;
use std::str::FromStr;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

// ── Scalars ──────────────────────────────────────────────────────────────

/// Primitive element kinds a kernel slot or buffer may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    F32,
    F64,
    I32,
    U32,
    U8,
    I64,
}

impl ScalarKind {
    pub const ALL: [ScalarKind; 6] = [
        ScalarKind::F32,
        ScalarKind::F64,
        ScalarKind::I32,
        ScalarKind::U32,
        ScalarKind::U8,
        ScalarKind::I64,
    ];

    /// OpenCL C spelling of the type.
    pub const fn c_name(self) -> &'static str {
        match self {
            ScalarKind::F32 => "float",
            ScalarKind::F64 => "double",
            ScalarKind::I32 => "int",
            ScalarKind::U32 => "uint",
            ScalarKind::U8 => "uchar",
            ScalarKind::I64 => "long",
        }
    }

    pub const fn size_bytes(self) -> usize {
        match self {
            ScalarKind::F32 | ScalarKind::I32 | ScalarKind::U32 => 4,
            ScalarKind::F64 | ScalarKind::I64 => 8,
            ScalarKind::U8 => 1,
        }
    }

    /// Parse an OpenCL C scalar type name, accepting the long unsigned forms.
    pub fn from_c_name(name: &str) -> Option<Self> {
        match name.trim() {
            "float" => Some(ScalarKind::F32),
            "double" => Some(ScalarKind::F64),
            "int" => Some(ScalarKind::I32),
            "uint" | "unsigned int" => Some(ScalarKind::U32),
            "uchar" | "unsigned char" => Some(ScalarKind::U8),
            "long" => Some(ScalarKind::I64),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.c_name())
    }
}

/// One scalar value tagged with its kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    F32(f32),
    F64(f64),
    I32(i32),
    U32(u32),
    U8(u8),
    I64(i64),
}

impl ScalarValue {
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarValue::F32(_) => ScalarKind::F32,
            ScalarValue::F64(_) => ScalarKind::F64,
            ScalarValue::I32(_) => ScalarKind::I32,
            ScalarValue::U32(_) => ScalarKind::U32,
            ScalarValue::U8(_) => ScalarKind::U8,
            ScalarValue::I64(_) => ScalarKind::I64,
        }
    }

    /// Native-endian bytes as they are copied into a kernel argument slot.
    pub fn to_ne_bytes(&self) -> Vec<u8> {
        match *self {
            ScalarValue::F32(v) => v.to_ne_bytes().to_vec(),
            ScalarValue::F64(v) => v.to_ne_bytes().to_vec(),
            ScalarValue::I32(v) => v.to_ne_bytes().to_vec(),
            ScalarValue::U32(v) => v.to_ne_bytes().to_vec(),
            ScalarValue::U8(v) => vec![v],
            ScalarValue::I64(v) => v.to_ne_bytes().to_vec(),
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Element types a compute buffer can hold.
///
/// Sealed: the set is closed and matches [`ScalarKind`] one to one.
pub trait Element:
    sealed::Sealed
    + Pod
    + Default
    + PartialEq
    + fmt::Debug
    + FromStr<Err: fmt::Display>
    + Send
    + Sync
    + 'static
{
    const KIND: ScalarKind;

    fn into_scalar(self) -> ScalarValue;

    /// Inverse of [`into_scalar`](Element::into_scalar); `None` on a kind mismatch.
    fn from_scalar(value: ScalarValue) -> Option<Self>;
}

macro_rules! impl_element {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const KIND: ScalarKind = ScalarKind::$kind;

                fn into_scalar(self) -> ScalarValue {
                    ScalarValue::$kind(self)
                }

                fn from_scalar(value: ScalarValue) -> Option<Self> {
                    match value {
                        ScalarValue::$kind(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_element! {
    f32 => F32,
    f64 => F64,
    i32 => I32,
    u32 => U32,
    u8 => U8,
    i64 => I64,
}

// ── Device description ───────────────────────────────────────────────────

/// Device category used when selecting a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Gpu,
    Cpu,
    Accelerator,
    All,
}

impl DeviceType {
    /// Native `cl_device_type` bit value.
    pub const fn bits(self) -> u64 {
        match self {
            DeviceType::Cpu => 1 << 1,
            DeviceType::Gpu => 1 << 2,
            DeviceType::Accelerator => 1 << 3,
            DeviceType::All => 0xFFFF_FFFF,
        }
    }

    /// Whether a device of type `other` satisfies this filter.
    pub fn matches(self, other: DeviceType) -> bool {
        self == DeviceType::All || self == other
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Gpu => "gpu",
            DeviceType::Cpu => "cpu",
            DeviceType::Accelerator => "accelerator",
            DeviceType::All => "all",
        };
        f.write_str(s)
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(DeviceType::Gpu),
            "cpu" => Ok(DeviceType::Cpu),
            "accelerator" => Ok(DeviceType::Accelerator),
            "all" => Ok(DeviceType::All),
            other => Err(format!("unknown device type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub index: usize,
    pub name: String,
    pub vendor: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub device_type: DeviceType,
    /// Host and device share one physical memory.
    pub host_unified_memory: bool,
    /// Nanoseconds per profiling timer tick.
    pub profiling_timer_resolution_ns: u64,
    pub max_work_group_size: usize,
    pub max_compute_units: u32,
    pub global_mem_bytes: u64,
}

/// Address space of a kernel pointer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressQualifier {
    Global,
    Local,
    Constant,
    Private,
}

impl AddressQualifier {
    pub const fn code(self) -> u32 {
        match self {
            AddressQualifier::Global => 0x119B,
            AddressQualifier::Local => 0x119C,
            AddressQualifier::Constant => 0x119D,
            AddressQualifier::Private => 0x119E,
        }
    }

    pub fn from_raw(code: u32) -> Option<Self> {
        match code {
            0x119B => Some(AddressQualifier::Global),
            0x119C => Some(AddressQualifier::Local),
            0x119D => Some(AddressQualifier::Constant),
            0x119E => Some(AddressQualifier::Private),
            _ => None,
        }
    }
}

impl fmt::Display for AddressQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddressQualifier::Global => "global",
            AddressQualifier::Local => "local",
            AddressQualifier::Constant => "constant",
            AddressQualifier::Private => "private",
        };
        f.write_str(s)
    }
}

/// Timestamp selector for event profiling queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfilingInfo {
    Queued,
    Submitted,
    Started,
    Ended,
}

impl ProfilingInfo {
    pub const ALL: [ProfilingInfo; 4] = [
        ProfilingInfo::Queued,
        ProfilingInfo::Submitted,
        ProfilingInfo::Started,
        ProfilingInfo::Ended,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_names_round_trip() {
        for kind in ScalarKind::ALL {
            assert_eq!(ScalarKind::from_c_name(kind.c_name()), Some(kind));
        }
        assert_eq!(ScalarKind::from_c_name("unsigned int"), Some(ScalarKind::U32));
        assert_eq!(ScalarKind::from_c_name("unsigned char"), Some(ScalarKind::U8));
        assert_eq!(ScalarKind::from_c_name("half"), None);
    }

    #[test]
    fn element_kind_matches_size() {
        assert_eq!(f32::KIND.size_bytes(), std::mem::size_of::<f32>());
        assert_eq!(f64::KIND.size_bytes(), std::mem::size_of::<f64>());
        assert_eq!(u8::KIND.size_bytes(), std::mem::size_of::<u8>());
        assert_eq!(i64::KIND.size_bytes(), std::mem::size_of::<i64>());
    }

    #[test]
    fn scalar_bytes_match_kind_size() {
        let v = 7u32.into_scalar();
        assert_eq!(v.kind(), ScalarKind::U32);
        assert_eq!(v.to_ne_bytes(), 7u32.to_ne_bytes().to_vec());
        assert_eq!(3u8.into_scalar().to_ne_bytes().len(), 1);
        assert_eq!(u32::from_scalar(v), Some(7));
        assert_eq!(f32::from_scalar(v), None);
    }

    #[test]
    fn device_type_parse_and_match() {
        assert_eq!("GPU".parse::<DeviceType>().unwrap(), DeviceType::Gpu);
        assert!("fpga".parse::<DeviceType>().is_err());
        assert!(DeviceType::All.matches(DeviceType::Cpu));
        assert!(!DeviceType::Gpu.matches(DeviceType::Cpu));
    }

    #[test]
    fn address_qualifier_codes() {
        for q in [
            AddressQualifier::Global,
            AddressQualifier::Local,
            AddressQualifier::Constant,
            AddressQualifier::Private,
        ] {
            assert_eq!(AddressQualifier::from_raw(q.code()), Some(q));
        }
        assert_eq!(AddressQualifier::from_raw(0), None);
    }
}
