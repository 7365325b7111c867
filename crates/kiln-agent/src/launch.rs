use std::path::{Path, PathBuf};

use kiln_process::ServerKind;

use crate::environment::LaunchSpec;

pub const DEFAULT_MEMORY_MB: u32 = 4096;

// G1 tuning commonly shipped with paper-style servers.
const JVM_TUNING_FLAGS: &[&str] = &[
    "-XX:+UseG1GC",
    "-XX:+ParallelRefProcEnabled",
    "-XX:MaxGCPauseMillis=200",
    "-XX:+UnlockExperimentalVMOptions",
    "-XX:+DisableExplicitGC",
    "-XX:+AlwaysPreTouch",
    "-XX:G1NewSizePercent=30",
    "-XX:G1MaxNewSizePercent=40",
    "-XX:G1HeapRegionSize=8M",
    "-XX:G1ReservePercent=20",
    "-XX:G1HeapWastePercent=5",
    "-XX:G1MixedGCCountTarget=4",
    "-XX:InitiatingHeapOccupancyPercent=15",
    "-XX:G1MixedGCLiveThresholdPercent=90",
    "-XX:G1RSetUpdatingPauseTimePercent=5",
    "-XX:SurvivorRatio=32",
    "-XX:+PerfDisableSharedMem",
    "-XX:MaxTenuringThreshold=1",
];

fn collect_named_files(root: &Path, file_name: &str, out: &mut Vec<PathBuf>) {
    let rd = match std::fs::read_dir(root) {
        Ok(v) => v,
        Err(_) => return,
    };
    for e in rd.flatten() {
        let path = e.path();
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            collect_named_files(&path, file_name, out);
            continue;
        }
        if meta.is_file()
            && path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|n| n == file_name)
        {
            out.push(path);
        }
    }
}

fn shallowest(mut candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.sort_by(|a, b| {
        let la = a.components().count();
        let lb = b.components().count();
        la.cmp(&lb)
            .then_with(|| a.to_string_lossy().cmp(&b.to_string_lossy()))
    });
    candidates.into_iter().next()
}

/// Forge/neoforge packs ship their launch arguments in `libraries/**/unix_args.txt`.
fn find_unix_args(root: &Path) -> Option<PathBuf> {
    let mut out = Vec::<PathBuf>::new();
    let libs = root.join("libraries");
    if libs.is_dir() {
        collect_named_files(&libs, "unix_args.txt", &mut out);
    }
    shallowest(out)
}

/// `server.jar` if present, otherwise the first other jar that is not an
/// installer.
pub fn find_server_jar(root: &Path) -> Option<PathBuf> {
    let preferred = root.join("server.jar");
    if preferred.is_file() {
        return Some(preferred);
    }
    let rd = std::fs::read_dir(root).ok()?;
    let mut jars: Vec<PathBuf> = rd
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_ascii_lowercase())
                .is_some_and(|n| n.ends_with(".jar") && !n.contains("installer"))
        })
        .collect();
    jars.sort();
    jars.into_iter().next()
}

fn to_rel_str(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let s = rel.to_string_lossy().to_string();
    if s.trim().is_empty() { None } else { Some(s) }
}

fn memory_flags(memory_mb: u32) -> [String; 2] {
    let mb = memory_mb.max(256);
    [format!("-Xms{mb}M"), format!("-Xmx{mb}M")]
}

/// Builds the launch command for a server directory.
///
/// Nothing here fails: a missing jar or binary is reported by the supervisor
/// at start time, against the artifact recorded in the spec.
pub fn resolve_launch_spec(root: &Path, kind: ServerKind, memory_mb: u32) -> LaunchSpec {
    match kind {
        ServerKind::Bedrock => LaunchSpec::new("./bedrock_server", root)
            .env("LD_LIBRARY_PATH", ".")
            .with_artifact(root.join("bedrock_server")),
        ServerKind::Java => {
            if let Some(jar) = find_server_jar(root) {
                let jar_rel = to_rel_str(root, &jar).unwrap_or_else(|| "server.jar".to_string());
                return LaunchSpec::new("java", root)
                    .args(memory_flags(memory_mb))
                    .args(JVM_TUNING_FLAGS.iter().copied())
                    .arg("-Dusing.aikars.flags=true")
                    .args(["-jar".to_string(), jar_rel, "nogui".to_string()])
                    .with_artifact(jar);
            }

            if let Some(unix_args) = find_unix_args(root)
                && let Some(unix_rel) = to_rel_str(root, &unix_args)
            {
                let mut spec = LaunchSpec::new("java", root).args(memory_flags(memory_mb));
                let user_jvm = root.join("user_jvm_args.txt");
                if user_jvm.is_file() {
                    spec = spec.arg("@user_jvm_args.txt");
                }
                return spec
                    .arg(format!("@{unix_rel}"))
                    .arg("nogui")
                    .with_artifact(unix_args);
            }

            let jar = root.join("server.jar");
            LaunchSpec::new("java", root)
                .args(memory_flags(memory_mb))
                .args(JVM_TUNING_FLAGS.iter().copied())
                .arg("-Dusing.aikars.flags=true")
                .args(["-jar", "server.jar", "nogui"])
                .with_artifact(jar)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_server_jar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("aaa.jar"), b"").unwrap();
        std::fs::write(dir.path().join("server.jar"), b"").unwrap();
        let spec = resolve_launch_spec(dir.path(), ServerKind::Java, 2048);
        assert_eq!(spec.program, "java");
        assert_eq!(&spec.args[..2], &["-Xms2048M".to_string(), "-Xmx2048M".to_string()]);
        assert!(spec.args.ends_with(&[
            "-jar".to_string(),
            "server.jar".to_string(),
            "nogui".to_string()
        ]));
        assert_eq!(spec.artifact, Some(dir.path().join("server.jar")));
    }

    #[test]
    fn skips_installer_jars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("forge-installer.jar"), b"").unwrap();
        std::fs::write(dir.path().join("paper-1.20.4-499.jar"), b"").unwrap();
        let jar = find_server_jar(dir.path()).unwrap();
        assert!(jar.ends_with("paper-1.20.4-499.jar"));
    }

    #[test]
    fn forge_pack_uses_args_files() {
        let dir = tempfile::tempdir().unwrap();
        let args_dir = dir
            .path()
            .join("libraries/net/minecraftforge/forge/1.20.1-47.2.0");
        std::fs::create_dir_all(&args_dir).unwrap();
        std::fs::write(args_dir.join("unix_args.txt"), b"").unwrap();
        std::fs::write(dir.path().join("user_jvm_args.txt"), b"").unwrap();

        let spec = resolve_launch_spec(dir.path(), ServerKind::Java, 100);
        assert_eq!(
            spec.args,
            vec![
                "-Xms256M".to_string(),
                "-Xmx256M".to_string(),
                "@user_jvm_args.txt".to_string(),
                "@libraries/net/minecraftforge/forge/1.20.1-47.2.0/unix_args.txt".to_string(),
                "nogui".to_string(),
            ]
        );
    }

    #[test]
    fn empty_java_dir_points_at_server_jar() {
        let dir = tempfile::tempdir().unwrap();
        let spec = resolve_launch_spec(dir.path(), ServerKind::Java, 1024);
        assert_eq!(spec.artifact, Some(dir.path().join("server.jar")));
    }

    #[test]
    fn bedrock_runs_bundled_binary() {
        let dir = tempfile::tempdir().unwrap();
        let spec = resolve_launch_spec(dir.path(), ServerKind::Bedrock, 1024);
        assert_eq!(spec.program, "./bedrock_server");
        assert!(spec.args.is_empty());
        assert_eq!(spec.env.get("LD_LIBRARY_PATH").map(String::as_str), Some("."));
        assert_eq!(spec.working_dir, dir.path());
    }
}
