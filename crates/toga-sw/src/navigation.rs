//! Navigation resolver: maps any navigated URL to one of the known app pages.

use url::Url;

/// Known app pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Page {
    Home,
    Gallery,
    Ar,
    Profile,
    MarkerGenerator,
    PrintMarkers,
}

/// Scope-relative paths accepted for each page. The bare page name is accepted
/// alongside the `.html` document.
const ROUTES: &[(&str, Page)] = &[
    ("", Page::Home),
    ("index.html", Page::Home),
    ("index", Page::Home),
    ("gallery.html", Page::Gallery),
    ("gallery", Page::Gallery),
    ("ar.html", Page::Ar),
    ("ar", Page::Ar),
    ("profile.html", Page::Profile),
    ("profile", Page::Profile),
    ("marker-generator.html", Page::MarkerGenerator),
    ("marker-generator", Page::MarkerGenerator),
    ("print-markers.html", Page::PrintMarkers),
    ("print-markers", Page::PrintMarkers),
];

impl Page {
    /// Stable page identifier.
    pub fn id(&self) -> &'static str {
        match self {
            Page::Home => "home",
            Page::Gallery => "gallery",
            Page::Ar => "ar",
            Page::Profile => "profile",
            Page::MarkerGenerator => "marker-generator",
            Page::PrintMarkers => "print-markers",
        }
    }

    /// Scope-relative document path; the app-shell key for this page.
    pub fn path(&self) -> &'static str {
        match self {
            Page::Home => "./index.html",
            Page::Gallery => "./gallery.html",
            Page::Ar => "./ar.html",
            Page::Profile => "./profile.html",
            Page::MarkerGenerator => "./marker-generator.html",
            Page::PrintMarkers => "./print-markers.html",
        }
    }

    /// Resolve a navigated URL against the registration scope. Never fails;
    /// anything unrecognized is the home page.
    pub fn resolve(url: &Url, scope: &Url) -> Page {
        let relative = relative_path(url.path(), scope.path());
        let relative = relative.trim_matches('/');

        ROUTES
            .iter()
            .find(|(route, _)| *route == relative)
            .map(|(_, page)| *page)
            .unwrap_or(Page::Home)
    }
}

/// Strip the scope prefix from `path`. A path outside the scope is the scope
/// root.
fn relative_path<'a>(path: &'a str, scope_path: &str) -> &'a str {
    if let Some(rest) = path.strip_prefix(scope_path) {
        return rest;
    }
    // scope "/app/" with path "/app" is the scope root
    let bare = scope_path.trim_end_matches('/');
    match path.strip_prefix(bare) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => "",
    }
}
