//! Backend REST paths, relative to the API base origin.

pub mod auth {
    pub const LOGIN: &str = "/user/login/";
    pub const LOGOUT: &str = "/user/logout/";
    pub const REFRESH: &str = "/user/token/refresh/";
}

pub mod admin_auth {
    pub const LOGIN: &str = "/admin/login/";
}

pub mod notifications {
    pub const LIST: &str = "/user/notifications/";

    pub fn mark_read(id: i64) -> String {
        format!("/user/notifications/{id}/read/")
    }
}

pub mod provider {
    /// Multipart POST.
    pub const APPLY: &str = "/provider/apply/";
    pub const STATUS: &str = "/provider/status/";
}
