use serde::Deserialize;
use serde_json::Value;

/// Mount points every judged process sees. Sources are read-only, the
/// binary directory carries compile artifacts, the working directory is the
/// per-testcase scratch space.
pub const SOURCE_MOUNT: &str = "/sandbox/source";
pub const BINARY_MOUNT: &str = "/sandbox/binary";
pub const WORKING_MOUNT: &str = "/sandbox/working";

/// Name of the optional file a compile script leaves next to the binary,
/// carrying an opaque language-defined string (e.g. the compiler banner).
pub const EXTRA_INFO_FILENAME: &str = ".extra-info";

/// The closed set of supported languages. Compile and run command tables
/// live here; everything else treats them through this registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Cpp,
    C,
    Python,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CppOptions {
    compiler: String,
    std: String,
    optimization: String,
}

impl Default for CppOptions {
    fn default() -> Self {
        Self { compiler: "g++".to_string(), std: "c++17".to_string(), optimization: "2".to_string() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct COptions {
    compiler: String,
    std: String,
    optimization: String,
}

impl Default for COptions {
    fn default() -> Self {
        Self { compiler: "gcc".to_string(), std: "c11".to_string(), optimization: "2".to_string() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PythonOptions {
    version: String,
}

impl Default for PythonOptions {
    fn default() -> Self {
        Self { version: "3".to_string() }
    }
}

impl Language {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "cpp" => Some(Self::Cpp),
            "c" => Some(Self::C),
            "python" => Some(Self::Python),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Cpp => "cpp",
            Self::C => "c",
            Self::Python => "python",
        }
    }

    pub fn source_filename(&self) -> &'static str {
        match self {
            Self::Cpp => "main.cpp",
            Self::C => "main.c",
            Self::Python => "main.py",
        }
    }

    /// Checkers written against testlib must be C++.
    pub fn is_cpp_family(&self) -> bool {
        matches!(self, Self::Cpp)
    }

    pub fn binary_size_limit(&self) -> u64 {
        match self {
            Self::Cpp | Self::C => 64 * 1024 * 1024,
            Self::Python => 16 * 1024 * 1024,
        }
    }

    /// (time ms, memory KiB) granted to the compiler.
    pub fn compile_limits(&self) -> (u64, u64) {
        match self {
            Self::Cpp | Self::C => (30_000, 1024 * 1024),
            Self::Python => (10_000, 256 * 1024),
        }
    }

    /// Shell script run inside the sandbox with sources mounted read-only at
    /// [`SOURCE_MOUNT`] and the artifact directory writable at
    /// [`BINARY_MOUNT`]. The leading `exec 2>&1` folds the compiler's stderr
    /// into the redirected message stream.
    pub fn compile_script(&self, options: &Value) -> String {
        match self {
            Self::Cpp => {
                let options: CppOptions =
                    serde_json::from_value(options.clone()).unwrap_or_default();
                format!(
                    "exec 2>&1\n\
                     {compiler} --version | head -n 1 > {BINARY_MOUNT}/{EXTRA_INFO_FILENAME}\n\
                     {compiler} -std={std} -O{optimization} -fdiagnostics-color=never \
                     -I {SOURCE_MOUNT} -o {BINARY_MOUNT}/a.out {SOURCE_MOUNT}/main.cpp\n",
                    compiler = options.compiler,
                    std = options.std,
                    optimization = options.optimization,
                )
            }
            Self::C => {
                let options: COptions = serde_json::from_value(options.clone()).unwrap_or_default();
                format!(
                    "exec 2>&1\n\
                     {compiler} --version | head -n 1 > {BINARY_MOUNT}/{EXTRA_INFO_FILENAME}\n\
                     {compiler} -std={std} -O{optimization} -fdiagnostics-color=never \
                     -I {SOURCE_MOUNT} -o {BINARY_MOUNT}/a.out {SOURCE_MOUNT}/main.c -lm\n",
                    compiler = options.compiler,
                    std = options.std,
                    optimization = options.optimization,
                )
            }
            Self::Python => {
                let options: PythonOptions =
                    serde_json::from_value(options.clone()).unwrap_or_default();
                format!(
                    "exec 2>&1\n\
                     python{version} -m py_compile {SOURCE_MOUNT}/main.py\n\
                     cp {SOURCE_MOUNT}/main.py {BINARY_MOUNT}/main.py\n",
                    version = options.version,
                )
            }
        }
    }

    /// Argv of the compiled program, referring to [`BINARY_MOUNT`].
    pub fn run_command(&self, options: &Value) -> Vec<String> {
        match self {
            Self::Cpp | Self::C => vec![format!("{BINARY_MOUNT}/a.out")],
            Self::Python => {
                let options: PythonOptions =
                    serde_json::from_value(options.clone()).unwrap_or_default();
                vec![format!("/usr/bin/python{}", options.version), format!("{BINARY_MOUNT}/main.py")]
            }
        }
    }

    /// Processes the language may legitimately spawn while running.
    pub fn run_process_limit(&self) -> u32 {
        match self {
            Self::Cpp | Self::C => 1,
            Self::Python => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Language;

    #[test]
    fn test_from_tag() {
        assert_eq!(Language::from_tag("cpp"), Some(Language::Cpp));
        assert_eq!(Language::from_tag("python"), Some(Language::Python));
        assert_eq!(Language::from_tag("cobol"), None);
    }

    #[test]
    fn test_cpp_compile_script_honors_options() {
        let script =
            Language::Cpp.compile_script(&json!({"compiler": "clang++", "std": "c++20"}));
        assert!(script.contains("clang++ -std=c++20"));
    }

    #[test]
    fn test_python_run_command() {
        let command = Language::Python.run_command(&json!({"version": "3.11"}));
        assert_eq!(command[0], "/usr/bin/python3.11");
    }
}
