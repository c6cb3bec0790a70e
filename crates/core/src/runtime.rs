//! ONNX Runtime and GPU library discovery, run once at process start.

use std::collections::HashSet;
use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found, for logging once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibReport {
    pub search_dirs: Vec<PathBuf>,
    /// Value of `ORT_DYLIB_PATH` after setup, if any.
    pub ort_dylib: Option<PathBuf>,
    /// Whether `ORT_DYLIB_PATH` was set by us rather than inherited.
    pub ort_dylib_discovered: bool,
    pub preloaded: Vec<PathBuf>,
}

/// Library search order: `<exe>/` (Windows), `<exe>/lib`, `<exe>/../lib`,
/// `<cwd>/lib`, then `/usr/local/lib` and `/usr/lib` on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

#[cfg(windows)]
fn prepend_dirs_to_path(dirs: &[PathBuf]) {
    let current: Option<OsString> = env::var_os("PATH");
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    let existing = current
        .as_ref()
        .map(|path| env::split_paths(path).collect::<Vec<_>>())
        .unwrap_or_default();
    for dir in dirs.iter().filter(|dir| dir.is_dir()).chain(existing.iter()) {
        let key = dir.to_string_lossy().replace('/', "\\").to_ascii_lowercase();
        if !dir.as_os_str().is_empty() && seen.insert(key) {
            merged.push(dir.clone());
        }
    }
    if let Ok(joined) = env::join_paths(merged) {
        env::set_var("PATH", joined);
    }
}

/// Load tier for GPU runtime libraries: CUDA (0), cuDNN (1), TensorRT (2).
///
/// ORT's own provider libraries are excluded; they need symbols from the ORT
/// core library, which the `ort` crate loads later.
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["libcudart", "libcublas", "libcufft", "libcurand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["cudart64_", "cublas64_", "cublaslt64_"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries to preload, in dependency order. The first directory that
/// contains a given file name wins.
fn collect_preload_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !is_candidate_lib(&name, &path) || !seen.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// Loading with RTLD_GLOBAL makes the symbols visible to libraries ORT opens
/// later; glibc ignores `LD_LIBRARY_PATH` changes made after startup.
#[cfg(unix)]
fn load_library(path: &Path) -> bool {
    // SAFETY: loading CUDA/cuDNN/TensorRT runtime libraries runs only their
    // initialisers; the handle is leaked so the library stays mapped.
    match unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn load_library(path: &Path) -> bool {
    // SAFETY: see the unix variant.
    match unsafe { libloading::Library::new(path) } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point `ort` at a bundled ONNX Runtime and preload GPU libraries.
///
/// Call at the very start of `main()`, before any ORT session is built.
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let search_dirs = candidate_lib_dirs();
    let mut ort_dylib_discovered = false;

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&search_dirs) {
            env::set_var(ORT_DYLIB_ENV, &path);
            ort_dylib_discovered = true;
        }

        #[cfg(windows)]
        prepend_dirs_to_path(&search_dirs);
    }

    let preloaded = collect_preload_libs(&search_dirs)
        .into_iter()
        .filter(|path| load_library(path))
        .collect();

    RuntimeLibReport {
        ort_dylib: env::var_os(ORT_DYLIB_ENV).map(PathBuf::from),
        ort_dylib_discovered,
        preloaded,
        search_dirs,
    }
}

pub fn log_runtime_lib_status(report: &RuntimeLibReport) {
    match &report.ort_dylib {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            discovered = report.ort_dylib_discovered,
            "ONNX Runtime library"
        ),
        Some(path) => warn!(path = %path.display(), "ORT_DYLIB_PATH points to a missing file"),
        None => warn!("ORT_DYLIB_PATH not set, ONNX Runtime will use default search paths"),
    }
    for path in &report.preloaded {
        debug!(path = %path.display(), "Preloaded GPU runtime library");
    }
}
