// station_ingest - Rate-limited ingestion and backfill for weather station APIs
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::client::Device;
use std::sync::{Arc, PoisonError, RwLock};

/// Devices visible to the configured credentials.
///
/// Empty until someone validates the credentials and calls [`DeviceCache::refresh`].
/// Reads never fetch anything: an empty cache stays empty until it is explicitly
/// refreshed again.
#[derive(Debug, Default)]
pub struct DeviceCache {
    devices: RwLock<Option<Arc<Vec<Device>>>>,
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<Vec<Device>>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn refresh(&self, devices: Vec<Device>) {
        let mut guard = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Arc::new(devices));
    }

    pub fn invalidate(&self) {
        let mut guard = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }

    /// True when the cache is populated and lists a device with this MAC address.
    pub fn contains(&self, mac_address: &str) -> bool {
        self.get()
            .map(|devices| devices.iter().any(|d| d.mac_address.eq_ignore_ascii_case(mac_address)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::DeviceCache;
    use crate::client::{Device, DeviceInfo};

    fn device(mac: &str) -> Device {
        Device {
            mac_address: mac.to_owned(),
            info: DeviceInfo::default(),
        }
    }

    #[test]
    fn test_empty_until_refreshed() {
        let cache = DeviceCache::new();
        assert!(cache.get().is_none());
        assert!(!cache.contains("AA:BB"));

        cache.refresh(vec![device("AA:BB")]);
        assert_eq!(1, cache.get().unwrap().len());
        assert!(cache.contains("aa:bb"));
    }

    #[test]
    fn test_invalidate_clears() {
        let cache = DeviceCache::new();
        cache.refresh(vec![device("AA:BB")]);
        let held = cache.get().unwrap();

        cache.invalidate();
        assert!(cache.get().is_none());
        // Readers holding a previous list keep it
        assert_eq!("AA:BB", held[0].mac_address);
    }
}
