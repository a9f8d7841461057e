//! Desktop environment lookup table
//!
//! | Desktop    | Display manager |
//! |------------|-----------------|
//! | None       | -               |
//! | GNOME      | gdm             |
//! | KDE Plasma | sddm            |
//! | XFCE       | lightdm         |
//! | LXQt       | sddm            |
//! | Cinnamon   | lightdm         |
//! | MATE       | lightdm         |
//! | i3         | lightdm         |
//!
//! Package lists are kept minimal but bootable into a graphical session.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum Desktop {
    /// Console only
    #[default]
    #[strum(serialize = "none")]
    #[serde(rename = "none")]
    None,
    #[strum(serialize = "GNOME")]
    #[serde(rename = "GNOME")]
    Gnome,
    #[strum(to_string = "KDE Plasma", serialize = "kde", serialize = "plasma")]
    #[serde(rename = "KDE Plasma")]
    KdePlasma,
    #[strum(serialize = "XFCE")]
    #[serde(rename = "XFCE")]
    Xfce,
    #[strum(serialize = "LXQt")]
    #[serde(rename = "LXQt")]
    Lxqt,
    #[strum(serialize = "Cinnamon")]
    #[serde(rename = "Cinnamon")]
    Cinnamon,
    #[strum(serialize = "MATE")]
    #[serde(rename = "MATE")]
    Mate,
    #[strum(serialize = "i3")]
    #[serde(rename = "i3")]
    I3,
}

const LIGHTDM: &[&str] = &["lightdm", "lightdm-gtk-greeter"];

impl Desktop {
    /// Packages installed for this desktop, display manager included
    pub fn packages(self) -> Vec<&'static str> {
        let base: &[&str] = match self {
            Self::None => return Vec::new(),
            Self::Gnome => &["gnome", "gdm"],
            Self::KdePlasma => &["plasma-meta", "konsole", "dolphin", "sddm"],
            Self::Xfce => &["xorg-server", "xfce4", "xfce4-goodies"],
            Self::Lxqt => &["xorg-server", "lxqt", "breeze-icons", "sddm"],
            Self::Cinnamon => &["xorg-server", "cinnamon", "gnome-terminal"],
            Self::Mate => &["xorg-server", "mate", "mate-extra"],
            Self::I3 => &["xorg-server", "i3-wm", "i3status", "i3lock", "dmenu", "xterm"],
        };
        let mut packages = base.to_vec();
        if self.display_manager() == Some("lightdm") {
            packages.extend_from_slice(LIGHTDM);
        }
        packages
    }

    /// systemd unit enabled so the system boots into a login screen
    pub fn display_manager(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gnome => Some("gdm"),
            Self::KdePlasma | Self::Lxqt => Some("sddm"),
            Self::Xfce | Self::Cinnamon | Self::Mate | Self::I3 => Some("lightdm"),
        }
    }

    pub fn is_graphical(self) -> bool {
        self != Self::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_display_names() {
        let names: Vec<String> = Desktop::iter().skip(1).map(|d| d.to_string()).collect();
        assert_eq!(
            names,
            vec!["GNOME", "KDE Plasma", "XFCE", "LXQt", "Cinnamon", "MATE", "i3"]
        );
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(Desktop::from_str("gnome").unwrap(), Desktop::Gnome);
        assert_eq!(Desktop::from_str("kde plasma").unwrap(), Desktop::KdePlasma);
        assert_eq!(Desktop::from_str("KDE").unwrap(), Desktop::KdePlasma);
        assert_eq!(Desktop::from_str("I3").unwrap(), Desktop::I3);
        assert!(Desktop::from_str("enlightenment").is_err());
    }

    #[test]
    fn test_every_graphical_desktop_ships_its_display_manager() {
        for desktop in Desktop::iter().filter(|d| d.is_graphical()) {
            let dm = desktop.display_manager().expect("graphical desktop has a DM");
            assert!(
                desktop.packages().contains(&dm),
                "{} does not install {}",
                desktop,
                dm
            );
        }
    }

    #[test]
    fn test_none_installs_nothing() {
        assert!(Desktop::None.packages().is_empty());
        assert_eq!(Desktop::None.display_manager(), None);
    }

    #[test]
    fn test_serde_uses_display_names() {
        let json = serde_json::to_string(&Desktop::KdePlasma).unwrap();
        assert_eq!(json, "\"KDE Plasma\"");
        let parsed: Desktop = serde_json::from_str("\"LXQt\"").unwrap();
        assert_eq!(parsed, Desktop::Lxqt);
    }
}
