/// Implements [`Bindable`](crate::binder::Bindable) for a struct.
///
/// Each entry is `source "key" => field`, where `source` is `query`, `path`
/// or `form`. A trailing `json` marker lets the body binder decode JSON onto
/// the value; the type then needs `Serialize + Deserialize`.
///
/// Field types must implement [`FromParam`](crate::binder::FromParam);
/// anything else is a compile error.
///
/// ```
/// use teta::bindable;
/// use teta::binder::Bindable;
///
/// #[derive(Default)]
/// struct Page {
///     number: u32,
///     size: Option<u16>,
/// }
///
/// bindable! {
///     Page {
///         query "page" => number,
///         query "per_page" => size,
///     }
/// }
///
/// assert_eq!(Page::FIELDS.len(), 2);
/// assert!(!Page::binds_body());
/// ```
#[macro_export]
macro_rules! bindable {
    (@impl $ty:ty { $($source:ident $key:literal => $field:ident),* } { $($extra:tt)* }) => {
        impl $crate::binder::Bindable for $ty {
            const FIELDS: &'static [$crate::binder::FieldSpec] = &[
                $($crate::binder::FieldSpec::$source(stringify!($field), $key)),*
            ];

            #[allow(unused_assignments, unused_mut, unused_variables)]
            fn set_field(
                &mut self,
                index: usize,
                raw: &str,
            ) -> ::std::result::Result<(), $crate::binder::ParamError> {
                let mut position = 0usize;
                $(
                    if position == index {
                        return $crate::binder::FromParam::set_param(&mut self.$field, raw);
                    }
                    position += 1;
                )*
                Ok(())
            }

            $($extra)*
        }
    };

    ($ty:ty { $($source:ident $key:literal => $field:ident),* $(,)? } json) => {
        $crate::bindable!(@impl $ty { $($source $key => $field),* } {
            const ACCEPTS_JSON: bool = true;

            fn decode_json(
                &mut self,
                body: &[u8],
            ) -> ::std::result::Result<(), $crate::binder::BindError> {
                $crate::binder::merge_json(self, body)
            }
        });
    };

    ($ty:ty { $($source:ident $key:literal => $field:ident),* $(,)? }) => {
        $crate::bindable!(@impl $ty { $($source $key => $field),* } {});
    };
}
