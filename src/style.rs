//! Terminal colors for CLI output
//!
//! Every command prints through [`Palette`] so a monitor key, a mapped output
//! or a failure looks the same everywhere.

use crossterm::style::{StyledContent, Stylize};

/// Semantic colors on top of crossterm's [`Stylize`]
///
/// ```
/// use mosw::style::Palette;
///
/// println!("{}", "MONITORS:".heading());
/// println!("{} {}", "DELL U2720Q: 0,0 -> 2560,1440".detail(), "Speakers".positive());
/// ```
pub trait Palette: Stylize<Styled = StyledContent<Self>> + Sized + std::fmt::Display {
    /// Section titles (bold cyan)
    fn heading(self) -> StyledContent<Self> {
        self.cyan().bold()
    }

    /// Running daemon, mapped outputs (green)
    fn positive(self) -> StyledContent<Self> {
        self.green()
    }

    /// Missing daemon, failures (red)
    fn failure(self) -> StyledContent<Self> {
        self.red()
    }

    /// Degraded states such as "no default output" (yellow)
    fn caution(self) -> StyledContent<Self> {
        self.yellow()
    }

    /// Keys, counts, paths (cyan)
    fn detail(self) -> StyledContent<Self> {
        self.cyan()
    }
}

impl Palette for &str {}
impl Palette for String {}
