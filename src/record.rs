//! Persisted run output: one binary position snapshot per timestep plus an
//! optional performance trace row.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::config::DBSIZE;
use crate::framework::BramData;

/// Drop any snapshots from previous runs so stale trajectories are never
/// rendered alongside fresh ones.
pub fn clear_records(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)
}

/// Write `records/t{t}`: for every cell in linear order, the 24-byte
/// little-endian `[x, y, z]` of each occupied slot in the half written this
/// timestep.
pub fn write_timestep(
    dir: &Path,
    t: usize,
    p_caches: &[BramData],
    half_base: usize,
) -> io::Result<()> {
    let mut file = fs::File::create(dir.join(format!("t{t}")))?;
    let mut buf = Vec::new();
    for cache in p_caches {
        for addr in half_base..half_base + DBSIZE {
            if let Some(r) = cache.get(addr).as_vec3() {
                for c in r.to_array() {
                    buf.extend_from_slice(&c.to_le_bytes());
                }
            }
        }
    }
    file.write_all(&buf)
}

/// Append one run summary row to the performance trace.
pub fn append_performance(
    path: &Path,
    n_particle: usize,
    n_cell: usize,
    t: usize,
    n_cpar: usize,
    n_ppar: usize,
    cycles_total: u64,
) -> io::Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{n_particle},{n_cell},{t},{n_cpar},{n_ppar},{cycles_total}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::Value;
    use crate::universe::Vec3;

    #[test]
    fn snapshot_holds_occupied_slots_in_cell_order() {
        let dir = std::env::temp_dir().join(format!("mdfab-records-{}", std::process::id()));
        clear_records(&dir).unwrap();

        let caches: Vec<BramData> = (0..2).map(|_| BramData::new(2 * DBSIZE)).collect();
        caches[0].set(0, Value::vec3(Vec3::new(1.0, 2.0, 3.0)));
        caches[1].set(0, Value::vec3(Vec3::new(4.0, 5.0, 6.0)));
        caches[1].set(1, Value::vec3(Vec3::new(7.0, 8.0, 9.0)));
        write_timestep(&dir, 0, &caches, 0).unwrap();

        let bytes = std::fs::read(dir.join("t0")).unwrap();
        assert_eq!(bytes.len(), 3 * 24);
        let first = f64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let last = f64::from_le_bytes(bytes[64..72].try_into().unwrap());
        assert_eq!(first, 1.0);
        assert_eq!(last, 9.0);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
