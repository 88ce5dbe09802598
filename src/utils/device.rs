use mlx_rs::{Device, DeviceType};

/// Device slot actually used for a requested id.
///
/// The GPU backend is Metal, which exposes a single GPU; other platforms run
/// on the CPU. Either way only index 0 exists.
fn resolve_device(device_id: usize) -> (DeviceType, &'static str, i32) {
    let (kind, name) = if cfg!(target_os = "macos") {
        (DeviceType::Gpu, "gpu")
    } else {
        (DeviceType::Cpu, "cpu")
    };
    if device_id != 0 {
        tracing::warn!("Only {} device 0 is available; ignoring device id {}", name, device_id);
    }
    (kind, name, 0)
}

/// Makes `device_id` the default MLX device.
pub fn select_device(device_id: usize) -> Device {
    let (kind, name, index) = resolve_device(device_id);
    let device = Device::new(kind, index);
    Device::set_default(&device);
    tracing::info!("Using {} device {}", name, index);
    device
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonzero_device_id_falls_back_to_device_zero() {
        let (_, name, index) = resolve_device(3);
        assert_eq!(index, 0);
        let expected = if cfg!(target_os = "macos") { "gpu" } else { "cpu" };
        assert_eq!(name, expected);
        assert_eq!(resolve_device(0).2, 0);
    }
}
