/// A NetBSD error number.
///
/// Defined by libc as an `int`, but every value the kernel can return fits in
/// a `u16`. Values are restricted to `1..=Errno::MAX`; unnamed values in that
/// range are still representable so that errors passed through from the host
/// kernel aren't lost.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Errno(u16);

macro_rules! define_errnos {
    ($($name:ident = $val:literal),+ $(,)?) => {
        impl Errno {
            $(pub const $name: Self = Self($val);)+

            /// The symbolic name of this value, if it has one.
            pub const fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $($val => Some(stringify!($name)),)+
                    _ => None,
                }
            }
        }
    };
}

define_errnos! {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    ENXIO = 6,
    E2BIG = 7,
    ENOEXEC = 8,
    EBADF = 9,
    ECHILD = 10,
    EDEADLK = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    ENOTBLK = 15,
    EBUSY = 16,
    EEXIST = 17,
    EXDEV = 18,
    ENODEV = 19,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    ENFILE = 23,
    EMFILE = 24,
    ENOTTY = 25,
    ETXTBSY = 26,
    EFBIG = 27,
    ENOSPC = 28,
    ESPIPE = 29,
    EROFS = 30,
    EMLINK = 31,
    EPIPE = 32,
    EDOM = 33,
    ERANGE = 34,
    EAGAIN = 35,
    EINPROGRESS = 36,
    EALREADY = 37,
    ENOTSOCK = 38,
    EDESTADDRREQ = 39,
    EMSGSIZE = 40,
    EPROTOTYPE = 41,
    ENOPROTOOPT = 42,
    EPROTONOSUPPORT = 43,
    ESOCKTNOSUPPORT = 44,
    EOPNOTSUPP = 45,
    EPFNOSUPPORT = 46,
    EAFNOSUPPORT = 47,
    EADDRINUSE = 48,
    EADDRNOTAVAIL = 49,
    ENETDOWN = 50,
    ENETUNREACH = 51,
    ENETRESET = 52,
    ECONNABORTED = 53,
    ECONNRESET = 54,
    ENOBUFS = 55,
    EISCONN = 56,
    ENOTCONN = 57,
    ESHUTDOWN = 58,
    ETOOMANYREFS = 59,
    ETIMEDOUT = 60,
    ECONNREFUSED = 61,
    ELOOP = 62,
    ENAMETOOLONG = 63,
    EHOSTDOWN = 64,
    EHOSTUNREACH = 65,
    ENOTEMPTY = 66,
    EPROCLIM = 67,
    EUSERS = 68,
    EDQUOT = 69,
    ESTALE = 70,
    EREMOTE = 71,
    EBADRPC = 72,
    ERPCMISMATCH = 73,
    EPROGUNAVAIL = 74,
    EPROGMISMATCH = 75,
    EPROCUNAVAIL = 76,
    ENOLCK = 77,
    ENOSYS = 78,
    EFTYPE = 79,
    EAUTH = 80,
    ENEEDAUTH = 81,
    EIDRM = 82,
    ENOMSG = 83,
    EOVERFLOW = 84,
    EILSEQ = 85,
    ENOTSUP = 86,
    ECANCELED = 87,
    EBADMSG = 88,
    ENODATA = 89,
    ENOSR = 90,
    ENOSTR = 91,
    ETIME = 92,
    ENOATTR = 93,
    EMULTIHOP = 94,
    ENOLINK = 95,
    EPROTO = 96,
    EOWNERDEAD = 97,
    ENOTRECOVERABLE = 98,
}

impl Errno {
    /// Largest error number the kernel defines (`ELAST`).
    pub const MAX: Self = Self::ENOTRECOVERABLE;

    pub const EWOULDBLOCK: Self = Self::EAGAIN;

    pub const fn from_u16_const(val: u16) -> Self {
        assert!(val >= 1 && val <= Self::MAX.0);
        Self(val)
    }

    pub fn to_u64(self) -> u64 {
        self.0.into()
    }

    pub fn to_negated_i64(self) -> i64 {
        -i64::from(self.0)
    }

    /// Decodes a raw return value that uses the negated-errno convention.
    pub fn from_negated_i64(val: i64) -> Option<Self> {
        let positive = u16::try_from(val.checked_neg()?).ok()?;
        Self::try_from(positive).ok()
    }
}

impl TryFrom<u16> for Errno {
    type Error = ();

    fn try_from(val: u16) -> Result<Self, Self::Error> {
        if (1..=(Self::MAX.0)).contains(&val) {
            Ok(Self(val))
        } else {
            Err(())
        }
    }
}

impl TryFrom<u64> for Errno {
    type Error = ();

    fn try_from(val: u64) -> Result<Self, Self::Error> {
        u16::try_from(val).map_err(|_| ()).and_then(Self::try_from)
    }
}

impl From<Errno> for u16 {
    fn from(val: Errno) -> u16 {
        val.0
    }
}

impl From<Errno> for i64 {
    fn from(val: Errno) -> i64 {
        val.0.into()
    }
}

impl core::fmt::Debug for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Errno::{name}"),
            None => write!(f, "Errno::<{}>", self.0),
        }
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "errno {}", self.0),
        }
    }
}
