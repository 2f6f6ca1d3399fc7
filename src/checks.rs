pub(crate) const HELPER_CLASS: &str = "notnullcheckweaver/NotNullHelper";
pub(crate) const BASE_EXCEPTION_CLASS: &str = "notnullcheckweaver/NotNullCheckException";

/// Operations of the check runtime called from woven code.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub(crate) enum CheckKind {
    Argument,
    Result,
    PutField,
    GetField,
    ConstructorField,
    StaticInitializerField,
}

/// Extra value passed to a check besides the checked reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CheckDetail {
    None,
    ArgumentIndex,
    FieldName,
}

impl CheckKind {
    pub(crate) const ALL: [CheckKind; 6] = [
        CheckKind::Argument,
        CheckKind::Result,
        CheckKind::PutField,
        CheckKind::GetField,
        CheckKind::ConstructorField,
        CheckKind::StaticInitializerField,
    ];

    pub(crate) fn method_name(self) -> &'static str {
        match self {
            CheckKind::Argument => "checkArgumentNotNull",
            CheckKind::Result => "checkResultNotNull",
            CheckKind::PutField => "checkPutFieldNotNull",
            CheckKind::GetField => "checkGetFieldNotNull",
            CheckKind::ConstructorField => "checkConstructorFieldNotNull",
            CheckKind::StaticInitializerField => "checkStaticInitializerFieldNotNull",
        }
    }

    pub(crate) fn detail(self) -> CheckDetail {
        match self {
            CheckKind::Argument => CheckDetail::ArgumentIndex,
            CheckKind::ConstructorField | CheckKind::StaticInitializerField => {
                CheckDetail::FieldName
            }
            CheckKind::Result | CheckKind::PutField | CheckKind::GetField => CheckDetail::None,
        }
    }

    /// Descriptor of the static helper method.
    pub(crate) fn method_descriptor(self) -> &'static str {
        match self.detail() {
            CheckDetail::None => "(Ljava/lang/Object;)V",
            CheckDetail::ArgumentIndex => "(Ljava/lang/Object;I)V",
            CheckDetail::FieldName => "(Ljava/lang/Object;Ljava/lang/String;)V",
        }
    }

    pub(crate) fn exception_class(self) -> &'static str {
        match self {
            CheckKind::Argument => "notnullcheckweaver/ArgumentNotNullCheckException",
            CheckKind::Result => "notnullcheckweaver/ResultNotNullCheckException",
            CheckKind::PutField => "notnullcheckweaver/PutFieldNotNullCheckException",
            CheckKind::GetField => "notnullcheckweaver/GetFieldNotNullCheckException",
            CheckKind::ConstructorField => {
                "notnullcheckweaver/ConstructorFieldNotNullCheckException"
            }
            CheckKind::StaticInitializerField => {
                "notnullcheckweaver/StaticInitializerFieldNotNullCheckException"
            }
        }
    }

    /// Constructor descriptor of the exception class.
    pub(crate) fn exception_constructor_descriptor(self) -> &'static str {
        match self.detail() {
            CheckDetail::None => "()V",
            CheckDetail::ArgumentIndex => "(I)V",
            CheckDetail::FieldName => "(Ljava/lang/String;)V",
        }
    }

    /// Message text split around the detail value, if the check has one.
    pub(crate) fn message_parts(self) -> (&'static str, &'static str) {
        match self {
            CheckKind::Argument => ("Argument for @NotNull parameter ", " is null."),
            CheckKind::Result => ("Returning null from a @NotNull method.", ""),
            CheckKind::PutField => ("Attempt to assign null to @NotNull field.", ""),
            CheckKind::GetField => ("Attempt to read uninitialized @NotNull field.", ""),
            CheckKind::ConstructorField => {
                ("Constructor did not initialize @NotNull field ", ".")
            }
            CheckKind::StaticInitializerField => {
                ("Static initializer did not initialize @NotNull field ", ".")
            }
        }
    }
}
