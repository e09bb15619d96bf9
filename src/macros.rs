/// Call a libc function and wrap the result, translating `-1` into the
/// last OS error the way every thin libc wrapper in `sys::unix` does.
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* )) => {{
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}
