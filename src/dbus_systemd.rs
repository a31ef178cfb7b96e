// This code was generated by `dbus-codegen-rust --system-bus --destination
// org.freedesktop.systemd1 --path /org/freedesktop/systemd1 --methods
// StartTransientUnit` against the systemd D-Bus manager interface, trimmed
// to the single method this crate calls. Do not edit by hand; regenerate
// instead if more of the interface is needed.

use dbus::arg;
use dbus::blocking;

pub trait OrgFreedesktopSystemd1Manager {
    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: Vec<(&str, arg::Variant<Box<dyn arg::RefArg>>)>,
        aux: Vec<(&str, Vec<(&str, arg::Variant<Box<dyn arg::RefArg>>)>)>,
    ) -> Result<dbus::Path<'static>, dbus::Error>;
}

impl<'a, T: blocking::BlockingSender, C: ::std::ops::Deref<Target = T>> OrgFreedesktopSystemd1Manager
    for blocking::Proxy<'a, C>
{
    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: Vec<(&str, arg::Variant<Box<dyn arg::RefArg>>)>,
        aux: Vec<(&str, Vec<(&str, arg::Variant<Box<dyn arg::RefArg>>)>)>,
    ) -> Result<dbus::Path<'static>, dbus::Error> {
        self.method_call(
            "org.freedesktop.systemd1.Manager",
            "StartTransientUnit",
            (name, mode, properties, aux),
        )
        .map(|r: (dbus::Path<'static>,)| r.0)
    }
}
