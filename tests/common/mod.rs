//! Fake GemStone tools shared by the integration tests.
//!
//! The scripts are written once per test binary and keep all per-stone
//! state under `$GEMSTONE_GLOBAL_DIR` (the test's own home), so tests can
//! run in parallel.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use maglev_node::core::ToolConfig;
use maglev_node::NodeConfig;
use tempfile::TempDir;

const START_STONE: &str = r#"#!/bin/sh
[ -f "$GEMSTONE_GLOBAL_DIR/fail_start" ] && exit 1
mkdir -p "$GEMSTONE_GLOBAL_DIR/locks"
echo "starting stone $1"
sleep 120 >/dev/null 2>&1 &
echo $! > "$GEMSTONE_GLOBAL_DIR/locks/$1.pid.tmp"
mv "$GEMSTONE_GLOBAL_DIR/locks/$1.pid.tmp" "$GEMSTONE_GLOBAL_DIR/locks/$1.pid"
"#;

const WAIT_STONE: &str = r#"#!/bin/sh
i=0
while [ ! -f "$GEMSTONE_GLOBAL_DIR/locks/$1.pid" ]; do
  i=$((i+1))
  [ $i -gt 20 ] && exit 1
  sleep 0.1
done
"#;

const GSLIST: &str = r#"#!/bin/sh
[ "$1" = "-p" ] && cat "$GEMSTONE_GLOBAL_DIR/locks/$2.pid" 2>/dev/null
exit 0
"#;

const RAKE: &str = r#"#!/bin/sh
name=$(echo "$1" | sed -e 's/^[^[]*\[//' -e 's/\]$//')
case "$1" in
  stone:create*)
    [ -f "$MAGLEV_HOME/skip_create" ] && exit 0
    mkdir -p "$MAGLEV_HOME/data/$name/extent" "$MAGLEV_HOME/etc/conf.d"
    touch "$MAGLEV_HOME/data/$name/extent/extent0.ruby.dbf" "$MAGLEV_HOME/etc/conf.d/$name.conf"
    ;;
  stone:destroy*)
    rm -rf "$MAGLEV_HOME/data/$name" "$MAGLEV_HOME/etc/conf.d/$name.conf"
    ;;
esac
"#;

fn tools_dir() -> &'static Path {
    static TOOLS: OnceLock<TempDir> = OnceLock::new();
    TOOLS
        .get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            for (name, body) in [
                ("startstone", START_STONE),
                ("waitstone", WAIT_STONE),
                ("gslist", GSLIST),
                ("rake", RAKE),
            ] {
                let path = dir.path().join(name);
                std::fs::write(&path, body).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
            dir
        })
        .path()
}

pub fn tools() -> ToolConfig {
    let dir = tools_dir();
    ToolConfig {
        start_stone: dir.join("startstone"),
        wait_stone: dir.join("waitstone"),
        list_stones: dir.join("gslist"),
        rake: dir.join("rake"),
    }
}

/// A MagLev home, a working-tree root and a file-backed record store
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        // scripts must exist before any test spawns a process
        tools_dir();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("home").join("gemstone")).unwrap();
        Self { dir }
    }

    pub fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    pub fn base_dir(&self) -> PathBuf {
        self.dir.path().join("base")
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("node.db")
    }

    pub fn local_db(&self) -> String {
        format!("sqlite:{}", self.db_path().display())
    }

    /// Run raw SQL against the record store file, next to any open node
    pub fn execute_sql(&self, sql: &str) {
        let conn = rusqlite::Connection::open(self.db_path()).unwrap();
        conn.busy_timeout(std::time::Duration::from_secs(5)).unwrap();
        conn.execute_batch(sql).unwrap();
    }

    pub fn config(&self, available_memory: i64) -> NodeConfig {
        NodeConfig {
            local_ip: "10.0.0.5".to_string(),
            available_memory,
            base_dir: Some(self.base_dir()),
            local_db: Some(self.local_db()),
            maglev_home: Some(self.home()),
            tools: tools(),
            ..Default::default()
        }
    }

    /// Make every following start attempt fail
    pub fn fail_starts(&self) {
        std::fs::write(self.home().join("fail_start"), b"").unwrap();
    }

    /// Make `stone:create` succeed without creating anything
    pub fn skip_create(&self) {
        std::fs::write(self.home().join("skip_create"), b"").unwrap();
    }

    pub fn extent_file(&self, name: &str) -> PathBuf {
        self.home()
            .join("data")
            .join(name)
            .join("extent")
            .join("extent0.ruby.dbf")
    }
}
