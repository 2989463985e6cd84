use candle::Device;

const MAX_PROBED_DEVICES: usize = 64;

/// Number of accelerator devices this process can open, or 1 on a CPU-only
/// host so that a node always runs at least one worker.
pub fn visible_devices() -> usize {
    if !candle::utils::cuda_is_available() {
        return 1;
    }
    let mut count = 0;
    while count < MAX_PROBED_DEVICES && Device::new_cuda(count).is_ok() {
        count += 1;
    }
    count.max(1)
}

/// Device for the worker at `local_rank`: the matching CUDA ordinal when CUDA
/// support is compiled in and available, otherwise the CPU.
pub fn select_device(local_rank: usize) -> anyhow::Result<Device> {
    if candle::utils::cuda_is_available() {
        let device = Device::new_cuda(local_rank)
            .map_err(|e| anyhow::anyhow!("open cuda device {}: {}", local_rank, e))?;
        return Ok(device);
    }
    Ok(Device::Cpu)
}

#[test]
fn test_cpu_fallback() -> anyhow::Result<()> {
    if candle::utils::cuda_is_available() {
        return Ok(());
    }
    assert_eq!(visible_devices(), 1);
    assert!(matches!(select_device(3)?, Device::Cpu));
    Ok(())
}
