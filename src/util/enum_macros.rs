/// Generates a BACnet enumeration whose upper range is open to vendors.
///
/// Named variants map to fixed values. Any other value that falls inside
/// `$custom_range` decodes to `Custom`, anything outside it to `Reserved`,
/// so decoding never fails and the raw value survives a round trip.
///
/// # Example
///
/// ```rust
/// use bacnet_appservice::generate_custom_enum;
///
/// generate_custom_enum! {
///     /// Example reason codes
///     Reason {
///         Other = 0,
///         Busy = 1,
///         VendorTimeout = 64,
///     },
///     u8,
///     64..=255
/// }
///
/// assert_eq!(Reason::from(1u8), Reason::Busy);
/// assert_eq!(Reason::from(64u8), Reason::VendorTimeout);
/// assert!(Reason::from(99u8).is_proprietary());
/// assert!(matches!(Reason::from(12u8), Reason::Reserved(_)));
/// assert_eq!(u8::from(Reason::from(99u8)), 99);
/// assert_eq!(format!("{}", Reason::from(99u8)), "Custom(99)");
/// ```
///
/// The generated type derives `Debug`, `Clone`, `Copy`, `PartialEq`, `Eq` and
/// `Hash`, implements `Display`, and converts both ways with `$unit`.
#[macro_export]
macro_rules! generate_custom_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident = $value:literal,)+ }, $unit:ident, $custom_range:expr) => {
        $crate::pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($variant,)*
                /// Unnamed value inside the proprietary range
                Custom( [<$name Value>] ),
                /// Unnamed value outside the proprietary range
                Reserved( [<$name Value>] ),
            }

            /// Raw value of an unnamed variant
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Value>] { value: $unit }

            impl [<$name Value>] {
                pub fn value(&self) -> $unit {
                    self.value
                }
            }

            impl $name {
                /// True when the value lies in the vendor range, named or not
                pub fn is_proprietary(&self) -> bool {
                    ($custom_range).contains(&<$unit>::from(*self))
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => f.write_str(stringify!($variant)),)*
                        $name::Custom(raw) => write!(f, "Custom({})", raw.value),
                        $name::Reserved(raw) => write!(f, "Reserved({})", raw.value),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Custom(raw) | $name::Reserved(raw) => raw.value,
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($custom_range).contains(&v) => $name::Custom([<$name Value>] { value: v }),
                        v => $name::Reserved([<$name Value>] { value: v }),
                    }
                }
            }
        }
    };
}
