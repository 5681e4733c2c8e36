/// Builds a `Value::Tuple` from anything convertible into `Value`.
///
/// ```
/// use orbpack::tuple;
///
/// let call = tuple!["add", 7, 3];
/// assert_eq!(call.as_tuple().map(|t| t.len()), Some(3));
/// ```
#[macro_export]
macro_rules! tuple {
    () => {
        $crate::Value::Tuple(::std::vec::Vec::new())
    };
    ($($item:expr),+ $(,)?) => {
        $crate::Value::Tuple(::std::vec![$($crate::Value::from($item)),+])
    };
}
