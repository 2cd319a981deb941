//! Device catalog: the engine's read/list/update contract plus two stores.
//!
//! The engine only writes the `active` flag; the CLI uses the rest.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::device::{normalize_interval, DeviceDescriptor, NewDevice, DEFAULT_INTERVAL_SECS};

pub trait DeviceCatalog: Send + Sync {
    /// All devices ordered by id.
    fn list(&self) -> Result<Vec<DeviceDescriptor>>;

    fn get(&self, id: i64) -> Result<Option<DeviceDescriptor>>;

    fn set_active(&self, id: i64, active: bool) -> Result<()>;

    /// Store a new device and return its id. Rejects duplicates.
    fn insert(&self, device: NewDevice) -> Result<i64>;

    /// Replace every catalog-owned field of `device.id`. Rejects duplicates.
    fn update(&self, device: &DeviceDescriptor) -> Result<()>;

    fn remove(&self, id: i64) -> Result<()>;

    /// First other device sharing `name` or `stream_address`.
    fn find_duplicate(
        &self,
        name: &str,
        stream_address: &str,
        exclude_id: Option<i64>,
    ) -> Result<Option<DeviceDescriptor>>;

    fn find_by_name(&self, name: &str) -> Result<Option<DeviceDescriptor>> {
        Ok(self.list()?.into_iter().find(|device| device.name == name))
    }
}

fn check_fields(name: &str, stream_address: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("device name must not be empty"));
    }
    if stream_address.trim().is_empty() {
        return Err(anyhow!("stream address must not be empty"));
    }
    Ok(())
}

fn duplicate_error(existing: &DeviceDescriptor) -> anyhow::Error {
    anyhow!(
        "a device with this name or stream address already exists (id {}, {})",
        existing.id,
        existing.name
    )
}

// -------------------- SQLite --------------------

pub struct SqliteDeviceCatalog {
    conn: Mutex<Connection>,
}

impl SqliteDeviceCatalog {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("failed to open device catalog {}", db_path))?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.ensure_schema()?;
        Ok(catalog)
    }

    /// Private in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let catalog = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        catalog.ensure_schema()?;
        Ok(catalog)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock().execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              rtsp_url TEXT NOT NULL,
              save_path TEXT NOT NULL DEFAULT '',
              interval INTEGER NOT NULL DEFAULT {},
              active INTEGER NOT NULL DEFAULT 0
            );
            "#,
            DEFAULT_INTERVAL_SECS
        ))?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

const DEVICE_COLUMNS: &str = "id, name, rtsp_url, save_path, interval, active";

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceDescriptor> {
    let interval: i64 = row.get(4)?;
    Ok(DeviceDescriptor {
        id: row.get(0)?,
        name: row.get(1)?,
        stream_address: row.get(2)?,
        destination_path: row.get(3)?,
        interval_seconds: normalize_interval(u32::try_from(interval).unwrap_or(0)),
        active: row.get(5)?,
    })
}

impl DeviceCatalog for SqliteDeviceCatalog {
    fn list(&self) -> Result<Vec<DeviceDescriptor>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices ORDER BY id ASC",
            DEVICE_COLUMNS
        ))?;
        let rows = stmt.query_map([], device_from_row)?;
        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    fn get(&self, id: i64) -> Result<Option<DeviceDescriptor>> {
        let conn = self.lock();
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
                params![id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    fn set_active(&self, id: i64, active: bool) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE devices SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        if changed == 0 {
            return Err(anyhow!("device {} not found", id));
        }
        Ok(())
    }

    fn insert(&self, device: NewDevice) -> Result<i64> {
        check_fields(&device.name, &device.stream_address)?;
        let interval = normalize_interval(device.interval_seconds.unwrap_or(DEFAULT_INTERVAL_SECS));
        let mut conn = self.lock();
        // Immediate: the write lock is taken before the duplicate check, so a
        // second process sharing the file cannot slip in between.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = duplicate_in(&tx, &device.name, &device.stream_address, None)? {
            return Err(duplicate_error(&existing));
        }
        tx.execute(
            "INSERT INTO devices (name, rtsp_url, save_path, interval, active)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                device.name,
                device.stream_address,
                device.destination_path,
                interval
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    fn update(&self, device: &DeviceDescriptor) -> Result<()> {
        check_fields(&device.name, &device.stream_address)?;
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) =
            duplicate_in(&tx, &device.name, &device.stream_address, Some(device.id))?
        {
            return Err(duplicate_error(&existing));
        }
        let changed = tx.execute(
            "UPDATE devices SET name = ?1, rtsp_url = ?2, save_path = ?3, interval = ?4
             WHERE id = ?5",
            params![
                device.name,
                device.stream_address,
                device.destination_path,
                normalize_interval(device.interval_seconds),
                device.id
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("device {} not found", device.id));
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, id: i64) -> Result<()> {
        let changed = self
            .lock()
            .execute("DELETE FROM devices WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(anyhow!("device {} not found", id));
        }
        Ok(())
    }

    fn find_duplicate(
        &self,
        name: &str,
        stream_address: &str,
        exclude_id: Option<i64>,
    ) -> Result<Option<DeviceDescriptor>> {
        duplicate_in(&self.lock(), name, stream_address, exclude_id)
    }
}

fn duplicate_in(
    conn: &Connection,
    name: &str,
    stream_address: &str,
    exclude_id: Option<i64>,
) -> Result<Option<DeviceDescriptor>> {
    let device = conn
        .query_row(
            &format!(
                "SELECT {} FROM devices
                 WHERE (name = ?1 OR rtsp_url = ?2) AND (?3 IS NULL OR id != ?3)
                 ORDER BY id ASC LIMIT 1",
                DEVICE_COLUMNS
            ),
            params![name, stream_address, exclude_id],
            device_from_row,
        )
        .optional()?;
    Ok(device)
}

fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

// -------------------- In memory --------------------

#[derive(Default)]
struct MemoryDevices {
    next_id: i64,
    devices: BTreeMap<i64, DeviceDescriptor>,
}

/// Catalog that lives only as long as the process.
#[derive(Default)]
pub struct InMemoryDeviceCatalog {
    inner: Mutex<MemoryDevices>,
}

impl InMemoryDeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from ready-made descriptors, keeping their ids.
    pub fn with_devices(devices: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        let catalog = Self::default();
        {
            let mut inner = catalog.lock();
            for device in devices {
                inner.next_id = inner.next_id.max(device.id);
                inner.devices.insert(device.id, device);
            }
        }
        catalog
    }

    fn lock(&self) -> MutexGuard<'_, MemoryDevices> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn first_duplicate<'a>(
    devices: impl Iterator<Item = &'a DeviceDescriptor>,
    name: &str,
    stream_address: &str,
    exclude_id: Option<i64>,
) -> Option<DeviceDescriptor> {
    devices
        .filter(|device| Some(device.id) != exclude_id)
        .find(|device| device.name == name || device.stream_address == stream_address)
        .cloned()
}

impl DeviceCatalog for InMemoryDeviceCatalog {
    fn list(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.lock().devices.values().cloned().collect())
    }

    fn get(&self, id: i64) -> Result<Option<DeviceDescriptor>> {
        Ok(self.lock().devices.get(&id).cloned())
    }

    fn set_active(&self, id: i64, active: bool) -> Result<()> {
        let mut inner = self.lock();
        let device = inner
            .devices
            .get_mut(&id)
            .ok_or_else(|| anyhow!("device {} not found", id))?;
        device.active = active;
        Ok(())
    }

    fn insert(&self, device: NewDevice) -> Result<i64> {
        check_fields(&device.name, &device.stream_address)?;
        let mut inner = self.lock();
        if let Some(existing) = first_duplicate(
            inner.devices.values(),
            &device.name,
            &device.stream_address,
            None,
        ) {
            return Err(duplicate_error(&existing));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.devices.insert(id, device.into_descriptor(id));
        Ok(id)
    }

    fn update(&self, device: &DeviceDescriptor) -> Result<()> {
        check_fields(&device.name, &device.stream_address)?;
        let mut inner = self.lock();
        if let Some(existing) = first_duplicate(
            inner.devices.values(),
            &device.name,
            &device.stream_address,
            Some(device.id),
        ) {
            return Err(duplicate_error(&existing));
        }
        let stored = inner
            .devices
            .get_mut(&device.id)
            .ok_or_else(|| anyhow!("device {} not found", device.id))?;
        let active = stored.active;
        *stored = device.clone();
        stored.interval_seconds = normalize_interval(device.interval_seconds);
        stored.active = active;
        Ok(())
    }

    fn remove(&self, id: i64) -> Result<()> {
        self.lock()
            .devices
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("device {} not found", id))
    }

    fn find_duplicate(
        &self,
        name: &str,
        stream_address: &str,
        exclude_id: Option<i64>,
    ) -> Result<Option<DeviceDescriptor>> {
        Ok(first_duplicate(
            self.lock().devices.values(),
            name,
            stream_address,
            exclude_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_device(name: &str, url: &str) -> NewDevice {
        NewDevice {
            name: name.to_string(),
            stream_address: url.to_string(),
            destination_path: String::new(),
            interval_seconds: None,
        }
    }

    fn exercise(catalog: &dyn DeviceCatalog) {
        let cam1 = catalog
            .insert(new_device("cam1", "rtsp://10.0.0.1/stream"))
            .expect("insert cam1");
        let cam2 = catalog
            .insert(new_device("cam2", "rtsp://10.0.0.2/stream"))
            .expect("insert cam2");
        assert_ne!(cam1, cam2);

        let stored = catalog.get(cam1).expect("get").expect("cam1 stored");
        assert_eq!(stored.interval_seconds, DEFAULT_INTERVAL_SECS);
        assert!(!stored.active);

        assert!(catalog
            .insert(new_device("cam1", "rtsp://10.0.0.9/stream"))
            .is_err());
        assert!(catalog
            .insert(new_device("cam3", "rtsp://10.0.0.2/stream"))
            .is_err());

        // Renaming a device onto itself is not a duplicate.
        let mut renamed = stored.clone();
        renamed.interval_seconds = 5;
        catalog.update(&renamed).expect("update self");
        assert_eq!(
            catalog.get(cam1).expect("get").expect("cam1").interval_seconds,
            5
        );

        renamed.name = "cam2".to_string();
        assert!(catalog.update(&renamed).is_err());

        catalog.set_active(cam2, true).expect("activate");
        assert!(catalog.get(cam2).expect("get").expect("cam2").active);
        assert_eq!(
            catalog
                .find_by_name("cam2")
                .expect("find")
                .map(|device| device.id),
            Some(cam2)
        );

        catalog.remove(cam1).expect("remove");
        assert!(catalog.get(cam1).expect("get").is_none());
        assert!(catalog.remove(cam1).is_err());
        assert!(catalog.set_active(cam1, true).is_err());
        assert_eq!(catalog.list().expect("list").len(), 1);
    }

    #[test]
    fn sqlite_catalog_contract() {
        let catalog = SqliteDeviceCatalog::open_in_memory().expect("catalog");
        exercise(&catalog);
    }

    #[test]
    fn in_memory_catalog_contract() {
        exercise(&InMemoryDeviceCatalog::new());
    }

    #[test]
    fn sqlite_catalog_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devices.db");
        let path = path.to_string_lossy().to_string();
        let id = {
            let catalog = SqliteDeviceCatalog::open(&path).expect("open");
            catalog
                .insert(NewDevice {
                    name: "gate".to_string(),
                    stream_address: "rtsp://gate/live".to_string(),
                    destination_path: "/data/gate".to_string(),
                    interval_seconds: Some(30),
                })
                .expect("insert")
        };
        let catalog = SqliteDeviceCatalog::open(&path).expect("reopen");
        let device = catalog.get(id).expect("get").expect("stored");
        assert_eq!(device.destination_path, "/data/gate");
        assert_eq!(device.interval_seconds, 30);
    }

    fn insert_same_device_concurrently(catalogs: &[&dyn DeviceCatalog]) -> usize {
        std::thread::scope(|scope| {
            let handles: Vec<_> = catalogs
                .iter()
                .map(|catalog| {
                    scope.spawn(move || catalog.insert(new_device("porch", "rtsp://10.0.0.5/live")))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("join"))
                .filter(Result::is_ok)
                .count()
        })
    }

    #[test]
    fn concurrent_inserts_of_same_device_admit_one() {
        let sqlite = SqliteDeviceCatalog::open_in_memory().expect("catalog");
        assert_eq!(insert_same_device_concurrently(&[&sqlite as &dyn DeviceCatalog; 8]), 1);
        assert_eq!(sqlite.list().expect("list").len(), 1);

        let memory = InMemoryDeviceCatalog::new();
        assert_eq!(insert_same_device_concurrently(&[&memory as &dyn DeviceCatalog; 8]), 1);
        assert_eq!(memory.list().expect("list").len(), 1);
    }

    #[test]
    fn concurrent_inserts_across_handles_admit_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devices.db").to_string_lossy().to_string();
        let handles: Vec<SqliteDeviceCatalog> = (0..4)
            .map(|_| SqliteDeviceCatalog::open(&path).expect("open"))
            .collect();
        let catalogs: Vec<&dyn DeviceCatalog> = handles
            .iter()
            .map(|catalog| catalog as &dyn DeviceCatalog)
            .collect();

        assert_eq!(insert_same_device_concurrently(&catalogs), 1);
        assert_eq!(handles[0].list().expect("list").len(), 1);
    }

    #[test]
    fn empty_fields_are_rejected() {
        let catalog = InMemoryDeviceCatalog::new();
        assert!(catalog.insert(new_device("", "rtsp://x")).is_err());
        assert!(catalog.insert(new_device("cam", " ")).is_err());
    }
}
