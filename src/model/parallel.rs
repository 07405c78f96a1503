use std::ops::Range;

/// Where the forward/backward pass of a batch executes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceStrategy<D> {
    SingleDevice(D),
    /// Each batch is split into contiguous shards, one per device. The
    /// first device holds the parameters and receives the merged results.
    DataParallel(Vec<D>),
}

impl<D> DeviceStrategy<D> {
    /// Falls back to a single device when fewer than two are given.
    pub fn data_parallel(mut devices: Vec<D>) -> Option<Self> {
        match devices.len() {
            0 => None,
            1 => devices.pop().map(DeviceStrategy::SingleDevice),
            _ => Some(DeviceStrategy::DataParallel(devices)),
        }
    }

    pub fn devices(&self) -> &[D] {
        match self {
            DeviceStrategy::SingleDevice(device) => std::slice::from_ref(device),
            DeviceStrategy::DataParallel(devices) => devices,
        }
    }

    pub fn primary(&self) -> &D {
        &self.devices()[0]
    }

    /// Splits `len` rows into at most one contiguous range per device,
    /// sizes differing by at most one.
    pub fn shards(&self, len: usize) -> Vec<(Range<usize>, &D)> {
        let devices = self.devices();
        let count = devices.len().min(len).max(1);
        let base = len / count;
        let extra = len % count;

        let mut start = 0;
        devices
            .iter()
            .take(count)
            .enumerate()
            .map(|(i, device)| {
                let size = base + usize::from(i < extra);
                let range = start..start + size;
                start += size;
                (range, device)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_device_single_shard() {
        let strategy = DeviceStrategy::SingleDevice("cpu");
        assert_eq!(strategy.shards(7), vec![(0..7, &"cpu")]);
        assert_eq!(strategy.primary(), &"cpu");
    }

    #[test]
    fn test_data_parallel_shards() {
        let strategy = DeviceStrategy::data_parallel(vec![0, 1, 2]).unwrap();
        let shards: Vec<_> = strategy.shards(10).into_iter().map(|(r, d)| (r, *d)).collect();
        assert_eq!(shards, vec![(0..4, 0), (4..7, 1), (7..10, 2)]);

        // Fewer rows than devices leaves trailing devices idle.
        let shards: Vec<_> = strategy.shards(2).into_iter().map(|(r, d)| (r, *d)).collect();
        assert_eq!(shards, vec![(0..1, 0), (1..2, 1)]);
    }

    #[test]
    fn test_data_parallel_degenerate_inputs() {
        assert_eq!(DeviceStrategy::<u8>::data_parallel(vec![]), None);
        assert_eq!(
            DeviceStrategy::data_parallel(vec![3]),
            Some(DeviceStrategy::SingleDevice(3))
        );
    }
}
