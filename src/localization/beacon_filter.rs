use crate::data::Beacon;

/// Scan pre-processing stage applied before weighting.
pub trait BeaconFilter: Send {
    fn apply(&self, scan: Vec<Beacon>) -> Vec<Beacon>;
}

/// Drops out-of-range readings and collapses duplicate ids, keeping the
/// strongest reading of each transmitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleansingBeaconFilter;

impl BeaconFilter for CleansingBeaconFilter {
    fn apply(&self, scan: Vec<Beacon>) -> Vec<Beacon> {
        let mut cleaned: Vec<Beacon> = Vec::with_capacity(scan.len());
        for beacon in scan {
            if !beacon.in_rssi_range() {
                continue;
            }
            match cleaned.iter_mut().find(|b| b.id == beacon.id) {
                Some(existing) => {
                    if beacon.rssi > existing.rssi {
                        existing.rssi = beacon.rssi;
                    }
                }
                None => cleaned.push(beacon),
            }
        }
        cleaned
    }
}

/// Keeps only the `n_strongest` readings by RSSI.
#[derive(Debug, Clone, Copy)]
pub struct StrongestBeaconFilter {
    pub n_strongest: usize,
}

impl Default for StrongestBeaconFilter {
    fn default() -> Self {
        Self { n_strongest: 10 }
    }
}

impl BeaconFilter for StrongestBeaconFilter {
    fn apply(&self, mut scan: Vec<Beacon>) -> Vec<Beacon> {
        scan.sort_by(|a, b| b.rssi.total_cmp(&a.rssi));
        scan.truncate(self.n_strongest);
        scan
    }
}

/// Ordered filter pipeline.
#[derive(Default)]
pub struct BeaconFilterChain {
    filters: Vec<Box<dyn BeaconFilter>>,
}

impl BeaconFilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cleansing followed by strongest-K, the standard streaming setup.
    pub fn standard(n_strongest: usize) -> Self {
        let mut chain = Self::new();
        chain.add(Box::new(CleansingBeaconFilter));
        chain.add(Box::new(StrongestBeaconFilter { n_strongest }));
        chain
    }

    pub fn add(&mut self, filter: Box<dyn BeaconFilter>) {
        self.filters.push(filter);
    }

    pub fn apply(&self, scan: Vec<Beacon>) -> Vec<Beacon> {
        self.filters
            .iter()
            .fold(scan, |scan, filter| filter.apply(scan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleansing_drops_out_of_range_and_duplicate_readings() {
        let scan = vec![
            Beacon::new(1, 1, -60.0),
            Beacon::new(1, 1, -55.0),
            Beacon::new(1, 2, 0.0),
            Beacon::new(1, 3, -100.0),
            Beacon::new(1, 4, -70.0),
        ];
        let cleaned = CleansingBeaconFilter.apply(scan);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].rssi, -55.0);
        assert_eq!(cleaned[1], Beacon::new(1, 4, -70.0));
    }

    #[test]
    fn strongest_filter_keeps_the_top_k() {
        let scan = vec![
            Beacon::new(1, 1, -80.0),
            Beacon::new(1, 2, -50.0),
            Beacon::new(1, 3, -65.0),
        ];
        let kept = StrongestBeaconFilter { n_strongest: 2 }.apply(scan);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], Beacon::new(1, 2, -50.0));
        assert_eq!(kept[1], Beacon::new(1, 3, -65.0));
    }

    #[test]
    fn standard_chain_composes_both_stages() {
        let mut scan: Vec<Beacon> = (0..20)
            .map(|minor| Beacon::new(1, minor, -40.0 - minor as f64))
            .collect();
        scan.push(Beacon::new(9, 9, 10.0)); // spurious positive reading
        let filtered = BeaconFilterChain::standard(10).apply(scan);
        assert_eq!(filtered.len(), 10);
        assert!(filtered.iter().all(|b| b.in_rssi_range()));
    }
}
