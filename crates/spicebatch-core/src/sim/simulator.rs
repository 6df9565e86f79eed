//! Simulator backends
//!
//! A [`Simulator`] turns a netlist path into the command line that runs it
//! and names the output files the run leaves behind. The runner only talks
//! to this trait, so any executable with a batch mode can be plugged in.

use crate::types::{Result, SpiceError};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Program and arguments of one simulator invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Split an executable prefix such as `["wine", "XVIIx64.exe"]` into program and leading args
    pub fn from_prefix(prefix: &[String]) -> Self {
        let (program, args) = prefix.split_first().map_or_else(
            || (String::new(), Vec::new()),
            |(p, rest)| (p.clone(), rest.to_vec()),
        );
        Self { program, args }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Output pair of a simulation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFiles {
    pub raw: PathBuf,
    pub log: PathBuf,
}

impl OutputFiles {
    /// `<netlist>.raw` and `<netlist>.log`
    pub fn for_netlist(netlist: &Path) -> Self {
        Self {
            raw: netlist.with_extension("raw"),
            log: netlist.with_extension("log"),
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Look a switch up in a backend table, substituting `<path>` with `param`
fn lookup_switch(
    simulator: &str,
    table: &[(&str, &[&str])],
    switch: &str,
    param: &str,
) -> Result<Vec<String>> {
    table
        .iter()
        .find(|(name, _)| *name == switch)
        .map(|(_, args)| args.iter().map(|a| a.replace("<path>", param)).collect())
        .ok_or_else(|| {
            SpiceError::Validation(format!("invalid switch '{}' for {}", switch, simulator))
        })
}

/// An external simulator executable
pub trait Simulator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Executable prefix, e.g. `["wine", "/path/XVIIx64.exe"]`
    fn executable(&self) -> &[String];

    /// Command line running `netlist` in batch mode with extra `switches`
    fn command_line(&self, netlist: &Path, switches: &[String]) -> CommandLine;

    fn output_files(&self, netlist: &Path) -> OutputFiles {
        OutputFiles::for_netlist(netlist)
    }

    /// Arguments that make the executable print its version, if it has any
    fn version_args(&self) -> Option<Vec<String>> {
        None
    }

    /// Run the executable with [`Simulator::version_args`] and return the first output line
    fn probe_version(&self) -> Result<String> {
        let args = self.version_args().ok_or_else(|| {
            SpiceError::NotFound(format!("{} has no version query", self.name()))
        })?;
        let cmd = CommandLine::from_prefix(self.executable()).args(args);
        debug!(command = %cmd, "Probing simulator version");

        let output = std::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .output()?;
        if !output.status.success() {
            return Err(SpiceError::Process(format!(
                "'{}' exited with {}",
                cmd, output.status
            )));
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| SpiceError::Process(format!("'{}' printed no version", cmd)))
    }

    /// Expand a named command-line switch into its arguments
    fn valid_switch(&self, switch: &str, param: &str) -> Result<Vec<String>>;
}

// ============================================================================
// LTspice
// ============================================================================

const LTSPICE_SWITCHES: &[(&str, &[&str])] = &[
    ("alt", &["-alt"]),
    ("ascii", &["-ascii"]),
    ("big", &["-big"]),
    ("encrypt", &["-encrypt"]),
    ("fastaccess", &["-FastAccess"]),
    ("FixUpSchematicFonts", &["-FixUpSchematicFonts"]),
    ("FixUpSymbolFonts", &["-FixUpSymbolFonts"]),
    ("ini", &["-ini", "<path>"]),
    ("I", &["-I<path>"]),
    ("max", &["-max"]),
    ("netlist", &["-netlist"]),
    ("norm", &["-norm"]),
    ("PCBnetlist", &["-PCBnetlist"]),
    ("SOI", &["-SOI"]),
    ("sync", &["-sync"]),
];

const LTSPICE_DEFAULT_EXE: &str = "XVIIx64.exe";
const LTSPICE_WINE_FOLDER: &str = ".wine/drive_c/Program Files/LTC/LTspiceXVII";
const LTSPICE_MACOS_EXE: &str = "/Applications/LTspice.app/Contents/MacOS/LTspice";

/// LTspice, run natively on Windows and macOS and through wine on Linux
#[derive(Debug, Clone)]
pub struct LtSpice {
    exe: Vec<String>,
}

impl LtSpice {
    pub fn new(exe: Vec<String>) -> Self {
        Self { exe }
    }

    /// Locate the installation
    ///
    /// On Linux, `LTSPICEFOLDER` and `LTSPICEEXECUTABLE` override the default
    /// wine prefix location.
    pub fn detect() -> Result<Self> {
        if cfg!(target_os = "linux") {
            let folder = env::var("LTSPICEFOLDER").ok().map(PathBuf::from).or_else(|| {
                env::var("HOME")
                    .ok()
                    .map(|home| Path::new(&home).join(LTSPICE_WINE_FOLDER))
            });
            let exe_name =
                env::var("LTSPICEEXECUTABLE").unwrap_or_else(|_| LTSPICE_DEFAULT_EXE.into());
            let exe = folder
                .map(|f| f.join(&exe_name))
                .unwrap_or_else(|| PathBuf::from(&exe_name));
            info!(exe = %exe.display(), "Using LTspice through wine");
            return Ok(Self::new(vec!["wine".into(), path_str(&exe)]));
        }
        if cfg!(target_os = "macos") {
            return Ok(Self::new(vec![LTSPICE_MACOS_EXE.into()]));
        }

        let mut candidates = Vec::new();
        if let Ok(local) = env::var("LOCALAPPDATA") {
            candidates.push(Path::new(&local).join(r"Programs\ADI\LTspice\LTspice.exe"));
        }
        candidates.extend(
            [
                r"C:\Program Files\ADI\LTspice\LTspice.exe",
                r"C:\Program Files\LTC\LTspiceXVII\XVIIx64.exe",
                r"C:\Program Files (x86)\LTC\LTspiceIV\scad3.exe",
            ]
            .map(PathBuf::from),
        );
        candidates
            .into_iter()
            .find(|c| c.exists())
            .map(|exe| {
                info!(exe = %exe.display(), "Using LTspice");
                Self::new(vec![path_str(&exe)])
            })
            .ok_or_else(|| SpiceError::NotFound("LTspice executable".into()))
    }

    /// Convert a schematic into a `.net` netlist
    pub fn create_netlist(&self, schematic: &Path) -> Result<PathBuf> {
        if cfg!(target_os = "macos") {
            return Err(SpiceError::Process(
                "LTspice cannot generate netlists on macOS".into(),
            ));
        }
        let cmd = CommandLine::from_prefix(&self.exe)
            .arg("-netlist")
            .arg(path_str(schematic));
        info!(command = %cmd, "Creating netlist");

        let status = std::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .status()?;
        let netlist = schematic.with_extension("net");
        if status.success() && netlist.exists() {
            Ok(netlist)
        } else {
            Err(SpiceError::Process(format!(
                "failed to create netlist from {}",
                schematic.display()
            )))
        }
    }
}

impl Simulator for LtSpice {
    fn name(&self) -> &str {
        "LTspice"
    }

    fn executable(&self) -> &[String] {
        &self.exe
    }

    fn command_line(&self, netlist: &Path, switches: &[String]) -> CommandLine {
        let cmd = CommandLine::from_prefix(&self.exe);
        let cmd = if cfg!(target_os = "macos") {
            cmd.arg("-b")
        } else {
            cmd.arg("-Run").arg("-b")
        };
        cmd.arg(path_str(netlist)).args(switches.iter().cloned())
    }

    fn valid_switch(&self, switch: &str, param: &str) -> Result<Vec<String>> {
        lookup_switch(self.name(), LTSPICE_SWITCHES, switch, param)
    }
}

// ============================================================================
// ngspice
// ============================================================================

const NGSPICE_SWITCHES: &[(&str, &[&str])] = &[
    ("-a", &["-a"]),
    ("--autorun", &["--autorun"]),
    ("-c", &["-c", "<path>"]),
    ("--circuitfile", &["--circuitfile", "<path>"]),
    ("-D", &["-D", "<path>"]),
    ("--define", &["--define", "<path>"]),
    ("-n", &["-n"]),
    ("--no-spiceinit", &["--no-spiceinit"]),
    ("--soa-log", &["--soa-log", "<path>"]),
];

#[derive(Debug, Clone)]
pub struct NgSpice {
    exe: Vec<String>,
}

impl NgSpice {
    pub fn new(exe: impl Into<String>) -> Self {
        Self {
            exe: vec![exe.into()],
        }
    }
}

impl Default for NgSpice {
    /// `ngspice` from `PATH`
    fn default() -> Self {
        Self::new("ngspice")
    }
}

impl Simulator for NgSpice {
    fn name(&self) -> &str {
        "ngspice"
    }

    fn executable(&self) -> &[String] {
        &self.exe
    }

    fn command_line(&self, netlist: &Path, switches: &[String]) -> CommandLine {
        let files = self.output_files(netlist);
        CommandLine::from_prefix(&self.exe)
            .args(switches.iter().cloned())
            .arg("-b")
            .arg("-o")
            .arg(path_str(&files.log))
            .arg("-r")
            .arg(path_str(&files.raw))
            .arg(path_str(netlist))
    }

    fn version_args(&self) -> Option<Vec<String>> {
        Some(vec!["--version".into()])
    }

    fn valid_switch(&self, switch: &str, param: &str) -> Result<Vec<String>> {
        lookup_switch(self.name(), NGSPICE_SWITCHES, switch, param)
    }
}

// ============================================================================
// QSPICE
// ============================================================================

const QSPICE_SWITCHES: &[(&str, &[&str])] = &[
    ("ASCII", &["-ASCII"]),
    ("binary", &["-binary"]),
    ("BSIM1", &["-BSIM1"]),
    ("Meyer", &["-Meyer"]),
    ("ProtectSelections", &["-ProtectSelections", "<path>"]),
    ("ProtectSubcircuits", &["-ProtectSubcircuits", "<path>"]),
];

/// QSPICE, Windows only
#[derive(Debug, Clone)]
pub struct QSpice {
    exe: Vec<String>,
}

impl QSpice {
    pub fn new(exe: impl Into<String>) -> Self {
        Self {
            exe: vec![exe.into()],
        }
    }

    pub fn detect() -> Result<Self> {
        let mut candidates = Vec::new();
        if let Ok(local) = env::var("LOCALAPPDATA") {
            candidates.push(Path::new(&local).join(r"Programs\Qspice\QSPICE64.exe"));
        }
        candidates.push(PathBuf::from(r"C:\Program Files\QSPICE\QSPICE64.exe"));
        candidates
            .into_iter()
            .find(|c| c.exists())
            .map(|exe| Self::new(path_str(&exe)))
            .ok_or_else(|| SpiceError::NotFound("QSPICE executable".into()))
    }
}

impl Simulator for QSpice {
    fn name(&self) -> &str {
        "QSPICE"
    }

    fn executable(&self) -> &[String] {
        &self.exe
    }

    fn command_line(&self, netlist: &Path, switches: &[String]) -> CommandLine {
        let files = self.output_files(netlist);
        CommandLine::from_prefix(&self.exe)
            .arg("-o")
            .arg(path_str(&files.log))
            .arg("-r")
            .arg(path_str(&files.raw))
            .arg(path_str(netlist))
            .args(switches.iter().cloned())
    }

    fn valid_switch(&self, switch: &str, param: &str) -> Result<Vec<String>> {
        lookup_switch(self.name(), QSPICE_SWITCHES, switch, param)
    }
}

// ============================================================================
// Xyce
// ============================================================================

const XYCE_SWITCHES: &[(&str, &[&str])] = &[
    ("syntax", &["-syntax"]),
    ("norun", &["-norun"]),
    ("max-warnings", &["-max-warnings", "<path>"]),
    ("prf", &["-prf", "<path>"]),
];

#[derive(Debug, Clone)]
pub struct Xyce {
    exe: Vec<String>,
}

impl Xyce {
    pub fn new(exe: impl Into<String>) -> Self {
        Self {
            exe: vec![exe.into()],
        }
    }
}

impl Default for Xyce {
    fn default() -> Self {
        Self::new("Xyce")
    }
}

impl Simulator for Xyce {
    fn name(&self) -> &str {
        "Xyce"
    }

    fn executable(&self) -> &[String] {
        &self.exe
    }

    fn command_line(&self, netlist: &Path, switches: &[String]) -> CommandLine {
        CommandLine::from_prefix(&self.exe)
            .arg("-b")
            .arg(path_str(netlist))
            .args(switches.iter().cloned())
    }

    fn version_args(&self) -> Option<Vec<String>> {
        Some(vec!["-v".into()])
    }

    fn valid_switch(&self, switch: &str, param: &str) -> Result<Vec<String>> {
        lookup_switch(self.name(), XYCE_SWITCHES, switch, param)
    }
}
