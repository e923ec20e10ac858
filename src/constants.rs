//! Wire-level constants: canned pages, reason phrases and bodies.

/// Page served for a bare `/` target.
pub const DEFAULT_PAGE: &str = "/judge.html";

/// Body sent in place of an empty file so a 200 never carries zero bytes.
pub const EMPTY_FILE_BODY: &str = "<html><body></body></html>";

/// Written raw (no HTTP framing) to connections rejected for capacity.
pub const BUSY_MESSAGE: &str = "Internal server busy";

pub const OK_200_TITLE: &str = "OK";
pub const ERROR_400_TITLE: &str = "Bad Request";
pub const ERROR_400_FORM: &str =
    "Your request has bad syntax or is inherently impossible to staisfy.\n";
pub const ERROR_403_TITLE: &str = "Forbidden";
pub const ERROR_403_FORM: &str = "You do not have permission to get file form this server.\n";
pub const ERROR_404_TITLE: &str = "Not Found";
pub const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
pub const ERROR_500_TITLE: &str = "Internal Error";
pub const ERROR_500_FORM: &str = "There was an unusual problem serving the request file.\n";

pub const REGISTER_PAGE: &str = "/register.html";
pub const LOGIN_PAGE: &str = "/log.html";
pub const PICTURE_PAGE: &str = "/picture.html";
pub const VIDEO_PAGE: &str = "/video.html";
pub const FANS_PAGE: &str = "/fans.html";
pub const WELCOME_PAGE: &str = "/welcome.html";
pub const LOGIN_ERROR_PAGE: &str = "/logError.html";
pub const REGISTER_ERROR_PAGE: &str = "/registerError.html";
