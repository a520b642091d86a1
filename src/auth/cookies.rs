use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

use super::jwt::TokenPair;

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

fn session_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .build()
}

/// Sets both token cookies on the jar.
pub fn set_session(jar: CookieJar, tokens: &TokenPair, secure: bool) -> CookieJar {
    jar.add(session_cookie(ACCESS_COOKIE, tokens.access_token.clone(), secure))
        .add(session_cookie(REFRESH_COOKIE, tokens.refresh_token.clone(), secure))
}

fn removal_cookie(name: &'static str, secure: bool) -> Cookie<'static> {
    let mut cookie = session_cookie(name, String::new(), secure);
    cookie.make_removal();
    cookie
}

/// Emits removal cookies for both tokens, whether or not the request carried them.
pub fn clear_session(jar: CookieJar, secure: bool) -> CookieJar {
    jar.add(removal_cookie(ACCESS_COOKIE, secure))
        .add(removal_cookie(REFRESH_COOKIE, secure))
}
