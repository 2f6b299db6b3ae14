use std::cell::Cell;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// Context — Where an array replica lives
//
// A Context is a (device type, device ordinal) pair. It is a plain value:
// Copy, hashable, and usable as a map key, which is how parameters index their
// per-device replicas.
//
// The device type ids match the native engine's numbering:
//
//   Cpu       = 1
//   Gpu       = 2
//   CpuPinned = 3
//
// There is also an ambient "current" context (cpu(0) unless overridden) used
// when an array is created or a parameter replica is requested without naming
// a device. It is thread-local and only changed through `ContextGuard`.

/// Kind of compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    Cpu = 1,
    Gpu = 2,
    CpuPinned = 3,
}

impl DeviceType {
    /// Numeric id as understood by the native engine.
    pub fn id(&self) -> i32 {
        *self as i32
    }

    pub fn from_id(id: i32) -> Result<Self> {
        match id {
            1 => Ok(DeviceType::Cpu),
            2 => Ok(DeviceType::Gpu),
            3 => Ok(DeviceType::CpuPinned),
            _ => Err(Error::InvalidArgument(format!("unknown device type id {id}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::CpuPinned => "cpu_pinned",
        }
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(DeviceType::Cpu),
            "gpu" => Ok(DeviceType::Gpu),
            "cpu_pinned" => Ok(DeviceType::CpuPinned),
            _ => Err(Error::InvalidArgument(format!("unknown device type '{s}'"))),
        }
    }
}

/// A compute device: device type plus ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Context {
    device_type: DeviceType,
    device_id: usize,
}

thread_local! {
    static CURRENT: Cell<Context> = const {
        Cell::new(Context { device_type: DeviceType::Cpu, device_id: 0 })
    };
}

impl Context {
    pub fn new(device_type: DeviceType, device_id: usize) -> Self {
        Context {
            device_type,
            device_id,
        }
    }

    /// `cpu(id)`.
    pub fn cpu(device_id: usize) -> Self {
        Self::new(DeviceType::Cpu, device_id)
    }

    /// `gpu(id)`.
    pub fn gpu(device_id: usize) -> Self {
        Self::new(DeviceType::Gpu, device_id)
    }

    /// `cpu_pinned(id)`.
    pub fn cpu_pinned(device_id: usize) -> Self {
        Self::new(DeviceType::CpuPinned, device_id)
    }

    /// Build from the string form of the device type, e.g. `("gpu", 1)`.
    pub fn from_name(device_type: &str, device_id: usize) -> Result<Self> {
        Ok(Self::new(device_type.parse()?, device_id))
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// The ambient default context for this thread.
    pub fn current() -> Context {
        CURRENT.with(|c| c.get())
    }

    /// Make `self` the ambient default until the returned guard drops.
    pub fn enter(self) -> ContextGuard {
        let previous = CURRENT.with(|c| c.replace(self));
        ContextGuard { previous }
    }

    /// Run `f` with `self` as the ambient default context.
    pub fn with<R>(self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::current()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.device_type.as_str(), self.device_id)
    }
}

impl FromStr for Context {
    type Err = Error;

    /// Parses `"cpu"`, `"gpu(1)"` or `"gpu:1"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (kind, id) = if let Some(open) = s.find('(') {
            let inner = s[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| Error::InvalidArgument(format!("malformed context '{s}'")))?;
            (&s[..open], inner)
        } else if let Some((kind, id)) = s.split_once(':') {
            (kind, id)
        } else {
            (s, "0")
        };
        let id = id
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::InvalidArgument(format!("malformed device id in '{s}'")))?;
        Context::from_name(kind.trim(), id)
    }
}

/// Restores the previous ambient context on drop.
#[must_use = "the context is reset as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Context,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}

/// Render a list of contexts as `[cpu(0), gpu(1)]`.
pub fn format_contexts(contexts: &[Context]) -> String {
    let parts: Vec<String> = contexts.iter().map(|c| c.to_string()).collect();
    format!("[{}]", parts.join(", "))
}
