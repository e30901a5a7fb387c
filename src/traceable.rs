//! Values that can be written into a message payload.
//!
//! Every traceable type contributes a short type key to the call site's
//! dictionary entry and appends fixed-width native bytes to the payload.
//! Keys of one message are comma separated, e.g. `"i,q,p"`.
//!
//! | key      | payload                                   |
//! |----------|-------------------------------------------|
//! | `u`      | 8-bit integer                             |
//! | `s`      | 16-bit integer                            |
//! | `i`      | 32-bit integer                            |
//! | `q`      | 64-bit integer                            |
//! | `c`      | one byte character                        |
//! | `b`      | bool as one byte                          |
//! | `f`, `d` | f32, f64                                  |
//! | `p`      | `[u8 len][bytes]`, truncated              |
//! | `OPT<k>` | `[u8 present][value of key k if present]` |

use crate::ring_buf::RingBuf;

pub trait Traceable {
    /// Appends this type's key (no separator) to `key`.
    fn type_key(key: &mut String);

    /// Appends this value's payload bytes.
    fn put(&self, rb: &mut RingBuf);
}

macro_rules! impl_traceable_int {
    ($($ty:ty => $key:literal),* $(,)?) => {
        $(
            impl Traceable for $ty {
                #[inline(always)]
                fn type_key(key: &mut String) {
                    key.push_str($key);
                }

                #[inline(always)]
                fn put(&self, rb: &mut RingBuf) {
                    rb.append(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_traceable_int! {
    u8 => "u", i8 => "u",
    u16 => "s", i16 => "s",
    u32 => "i", i32 => "i",
    u64 => "q", i64 => "q",
    f32 => "f", f64 => "d",
}

impl Traceable for usize {
    fn type_key(key: &mut String) {
        key.push('q');
    }

    #[inline(always)]
    fn put(&self, rb: &mut RingBuf) {
        rb.append(&(*self as u64).to_ne_bytes());
    }
}

impl Traceable for isize {
    fn type_key(key: &mut String) {
        key.push('q');
    }

    #[inline(always)]
    fn put(&self, rb: &mut RingBuf) {
        rb.append(&(*self as i64).to_ne_bytes());
    }
}

impl Traceable for bool {
    fn type_key(key: &mut String) {
        key.push('b');
    }

    #[inline(always)]
    fn put(&self, rb: &mut RingBuf) {
        rb.append(&[*self as u8]);
    }
}

/// Characters travel as a single byte; anything outside ASCII becomes `?`.
impl Traceable for char {
    fn type_key(key: &mut String) {
        key.push('c');
    }

    #[inline(always)]
    fn put(&self, rb: &mut RingBuf) {
        let byte = if self.is_ascii() { *self as u8 } else { b'?' };
        rb.append(&[byte]);
    }
}

impl Traceable for str {
    fn type_key(key: &mut String) {
        key.push('p');
    }

    #[inline(always)]
    fn put(&self, rb: &mut RingBuf) {
        rb.put_str(self);
    }
}

impl Traceable for String {
    fn type_key(key: &mut String) {
        key.push('p');
    }

    #[inline(always)]
    fn put(&self, rb: &mut RingBuf) {
        rb.put_str(self);
    }
}

impl<T: Traceable> Traceable for Option<T> {
    fn type_key(key: &mut String) {
        key.push_str("OPT");
        T::type_key(key);
    }

    #[inline(always)]
    fn put(&self, rb: &mut RingBuf) {
        match self {
            Some(v) => {
                rb.append(&[1]);
                v.put(rb);
            }
            None => rb.append(&[0]),
        }
    }
}

impl<T: Traceable + ?Sized> Traceable for &T {
    fn type_key(key: &mut String) {
        T::type_key(key);
    }

    #[inline(always)]
    fn put(&self, rb: &mut RingBuf) {
        (**self).put(rb);
    }
}

/// The argument list of one trace call.
///
/// Implemented for tuples of up to twelve [`Traceable`] values; the
/// `qtrace!` macro builds the tuple from its arguments.
pub trait TraceArgs {
    /// Comma separated type key of all arguments.
    fn type_key(&self) -> String;

    fn put_all(&self, rb: &mut RingBuf);
}

impl TraceArgs for () {
    fn type_key(&self) -> String {
        String::new()
    }

    fn put_all(&self, _rb: &mut RingBuf) {}
}

macro_rules! impl_trace_args {
    ($($name:ident . $idx:tt),+) => {
        impl<$($name: Traceable),+> TraceArgs for ($($name,)+) {
            fn type_key(&self) -> String {
                let mut key = String::new();
                $(
                    if !key.is_empty() {
                        key.push(',');
                    }
                    $name::type_key(&mut key);
                )+
                key
            }

            #[inline(always)]
            fn put_all(&self, rb: &mut RingBuf) {
                $( self.$idx.put(rb); )+
            }
        }
    };
}

impl_trace_args!(A.0);
impl_trace_args!(A.0, B.1);
impl_trace_args!(A.0, B.1, C.2);
impl_trace_args!(A.0, B.1, C.2, D.3);
impl_trace_args!(A.0, B.1, C.2, D.3, E.4);
impl_trace_args!(A.0, B.1, C.2, D.3, E.4, F.5);
impl_trace_args!(A.0, B.1, C.2, D.3, E.4, F.5, G.6);
impl_trace_args!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7);
impl_trace_args!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, I.8);
impl_trace_args!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, I.8, J.9);
impl_trace_args!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, I.8, J.9, K.10);
impl_trace_args!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, I.8, J.9, K.10, L.11);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_keys() {
        let args = (&1u8, &2i64, &"x", &Some(3.5f32), &true, &'c');
        assert_eq!(args.type_key(), "u,q,p,OPTf,b,c");
        assert_eq!(().type_key(), "");
        let nested: (Option<Option<String>>,) = (None,);
        assert_eq!(nested.type_key(), "OPTOPTp");
    }
}
