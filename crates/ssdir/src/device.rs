//! Compute device selection.

use std::{
    env::{self, VarError},
    process,
    sync::OnceLock,
};

use candle_core::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceKind {
    Cpu,
    Cuda,
}

impl DeviceKind {
    /// Parses the value of `SSDIR_DEVICE`. An unset variable selects the CPU.
    fn from_var(var: Result<&str, &VarError>) -> Result<Self, String> {
        match var {
            Ok("cpu") | Err(VarError::NotPresent) => Ok(Self::Cpu),
            Ok("cuda") => Ok(Self::Cuda),
            Ok(invalid) => Err(format!("'{invalid}'")),
            Err(VarError::NotUnicode(s)) => Err(s.to_string_lossy().into_owned()),
        }
    }
}

static DEVICE_KIND: OnceLock<DeviceKind> = OnceLock::new();

fn kind() -> DeviceKind {
    *DEVICE_KIND.get_or_init(|| {
        let var = env::var("SSDIR_DEVICE");
        match DeviceKind::from_var(var.as_deref()) {
            Ok(kind) => {
                log::debug!("using compute device {:?}", kind);
                kind
            }
            Err(invalid) => {
                eprintln!("invalid value set for `SSDIR_DEVICE` variable: {invalid}; exiting");
                process::exit(1);
            }
        }
    })
}

/// Returns the device selected by the `SSDIR_DEVICE` environment variable.
///
/// The variable is read once per process. Selecting `cuda` without CUDA support compiled into
/// `candle` results in an error.
pub fn get() -> anyhow::Result<Device> {
    match kind() {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Cuda => Ok(Device::new_cuda(0)?),
    }
}
