//! Ordered migration lists for both stores.
//!
//! Versions are contiguous from 1. Statements must stay safe to re-apply on
//! an already-migrated store: `CREATE` carries `IF NOT EXISTS`, and column
//! additions are guarded by the migrator's table-info check.

use crate::migrate::Migration;

pub static LOCAL_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "settings",
        sql: "CREATE TABLE IF NOT EXISTS settings (\n\
               id INTEGER PRIMARY KEY CHECK (id = 1),\n\
               backup_local_schedule TEXT,\n\
               backup_cloud_schedule TEXT,\n\
               cloud_enabled INTEGER NOT NULL DEFAULT 0,\n\
               remote_access_token TEXT,\n\
               remote_refresh_token TEXT,\n\
               directory_url TEXT,\n\
               clinic_id TEXT,\n\
               clinic_api_key TEXT,\n\
               updated_at INTEGER NOT NULL DEFAULT 0\n\
             );",
    },
    Migration {
        version: 2,
        name: "appointment_requests",
        sql: "CREATE TABLE IF NOT EXISTS appointment_requests (\n\
               id TEXT PRIMARY KEY,\n\
               patient_name TEXT NOT NULL,\n\
               phone TEXT,\n\
               date TEXT,\n\
               time TEXT,\n\
               status TEXT NOT NULL DEFAULT 'pending'\n\
                 CHECK (status IN ('pending','accepted','rejected')),\n\
               created_at INTEGER NOT NULL\n\
             );\n\
             CREATE INDEX IF NOT EXISTS idx_requests_date_time\n\
               ON appointment_requests(date, time);",
    },
    Migration {
        version: 3,
        name: "backup_audit",
        sql: "CREATE TABLE IF NOT EXISTS backup_audit (\n\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\n\
               destination TEXT NOT NULL CHECK (destination IN ('local','cloud')),\n\
               outcome TEXT NOT NULL CHECK (outcome IN ('ok','failed')),\n\
               detail TEXT,\n\
               created_at INTEGER NOT NULL\n\
             );\n\
             CREATE INDEX IF NOT EXISTS idx_backup_audit_created\n\
               ON backup_audit(created_at);",
    },
    Migration {
        version: 4,
        name: "requests_add_reason",
        sql: "ALTER TABLE appointment_requests ADD COLUMN reason TEXT;",
    },
];

pub static DIRECTORY_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "clinics",
        sql: "CREATE TABLE IF NOT EXISTS clinics (\n\
               id TEXT PRIMARY KEY,\n\
               name TEXT NOT NULL,\n\
               city TEXT NOT NULL,\n\
               specialty TEXT,\n\
               api_key_hash TEXT NOT NULL,\n\
               last_seen_at INTEGER\n\
             );",
    },
    Migration {
        version: 2,
        name: "slots",
        sql: "CREATE TABLE IF NOT EXISTS slots (\n\
               id TEXT PRIMARY KEY,\n\
               clinic_id TEXT NOT NULL REFERENCES clinics(id) ON DELETE CASCADE,\n\
               date TEXT NOT NULL,\n\
               time TEXT NOT NULL,\n\
               status TEXT NOT NULL DEFAULT 'AVAILABLE'\n\
                 CHECK (status IN ('AVAILABLE','HELD','BOOKED')),\n\
               hold_expires_at INTEGER\n\
             );\n\
             CREATE INDEX IF NOT EXISTS idx_slots_clinic_date\n\
               ON slots(clinic_id, date, time);",
    },
    Migration {
        version: 3,
        name: "messages",
        sql: "CREATE TABLE IF NOT EXISTS messages (\n\
               id TEXT PRIMARY KEY,\n\
               clinic_id TEXT NOT NULL REFERENCES clinics(id) ON DELETE CASCADE,\n\
               kind TEXT NOT NULL,\n\
               payload TEXT NOT NULL,\n\
               created_at INTEGER NOT NULL\n\
             );\n\
             CREATE INDEX IF NOT EXISTS idx_messages_clinic_created\n\
               ON messages(clinic_id, created_at);",
    },
];
