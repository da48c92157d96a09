use bitflags::bitflags;

bitflags! {
    /// Hot-swap eligibility markers, resolved once from attribute names.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Markers: u8 {
        /// Swap this type or function.
        const INCLUDE = 1 << 0;
        /// Swap every eligible function of the whole module.
        const INCLUDE_ALL = 1 << 1;
        /// Never swap. Overrides both includes.
        const EXCLUDE = 1 << 2;
        /// Synthesized by the compiler (closures, state machines).
        const COMPILER_GENERATED = 1 << 3;
    }
}

const INCLUDE_NAMES: &[&str] = &[
    "hotswap",
    "hotswapattribute",
    "hotswappable",
    "hotswappableattribute",
];

const INCLUDE_ALL_NAMES: &[&str] = &[
    "hotswapall",
    "hotswapallattribute",
    "hotswappableall",
    "hotswappableallattribute",
];

const EXCLUDE_NAMES: &[&str] = &["ignorehotswap", "ignorehotswapattribute"];

const COMPILER_GENERATED_NAMES: &[&str] = &["compilergenerated", "compilergeneratedattribute"];

impl Markers {
    /// Resolves a single attribute name. Matching is case-insensitive on the last
    /// `.`-separated segment, so `My.Tools.HotSwappableAttribute` is an include marker.
    pub fn from_attribute(name: &str) -> Self {
        let simple = name.rsplit('.').next().unwrap_or(name).to_ascii_lowercase();
        let simple = simple.as_str();

        if INCLUDE_NAMES.contains(&simple) {
            Self::INCLUDE
        } else if INCLUDE_ALL_NAMES.contains(&simple) {
            Self::INCLUDE_ALL
        } else if EXCLUDE_NAMES.contains(&simple) {
            Self::EXCLUDE
        } else if COMPILER_GENERATED_NAMES.contains(&simple) {
            Self::COMPILER_GENERATED
        } else {
            Self::empty()
        }
    }

    pub fn from_attributes<S: AsRef<str>>(names: &[S]) -> Self {
        names
            .iter()
            .fold(Self::empty(), |acc, name| acc | Self::from_attribute(name.as_ref()))
    }
}
