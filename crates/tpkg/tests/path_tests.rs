//! URI-path escaping tests.

use tpkg::path::UriPath;

#[test]
fn test_exact_escapes() {
    let cases = [
        // Plain URLs are unchanged.
        ("github.com/toitware/toit-morse", "github.com/toitware/toit-morse"),
        // Windows-reserved device names get a '%' marker.
        ("github.com/CON/pkg", "github.com/CON%/pkg"),
        ("github.com/con/pkg", "github.com/con%/pkg"),
        ("github.com/lpt9/pkg", "github.com/lpt9%/pkg"),
        // Empty segments get a '%' marker.
        ("https://example.com/pkg", "https%3A/%/example.com/pkg"),
        // Segments ending in '.' get a '%' marker.
        ("github.com/pkg./sub", "github.com/pkg.%/sub"),
        // ':' is never left unescaped.
        ("example.com:8080/pkg", "example.com%3A8080/pkg"),
    ];
    for (url, expected) in cases {
        assert_eq!(UriPath::from_url(url).as_str(), expected, "for {url}");
    }
}

#[test]
fn test_round_trips() {
    let urls = [
        "github.com/toitware/toit-morse",
        "github.com/toitware/test-pkg.git/bar/gee",
        "github.com/CON/pkg",
        "https://example.com/pkg",
        "example.com:8080/pkg",
        "github.com/pkg./sub",
        "github.com/50%off/pkg",
        "github.com/with space/pkg",
    ];
    for url in urls {
        let uri = UriPath::from_url(url);
        assert_eq!(uri.to_url(), url, "for {url}");
        assert!(!uri.as_str().contains(':'), "unescaped ':' in {uri}");
    }
}

#[test]
fn test_marker_is_stripped_on_decode() {
    // A URI path produced elsewhere with a marker on a non-reserved
    // segment still decodes by dropping the trailing '%'.
    let uri = UriPath::from_url("github.com/NUL/pkg");
    assert_eq!(uri.as_str(), "github.com/NUL%/pkg");
    assert_eq!(uri.to_url(), "github.com/NUL/pkg");
}

#[test]
fn test_file_path_escaping() {
    let uri = UriPath::from_file_path("github.com/foo/bar");
    assert_eq!(uri.as_str(), "github.com/foo/bar");
}
